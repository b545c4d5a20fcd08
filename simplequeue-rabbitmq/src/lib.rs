mod options;
mod rabbit_broker;

pub use options::{OptionsError, RabbitMqOptions, ENV_CONFIRMS, ENV_CONNECTION_NAME, ENV_URI};
pub use rabbit_broker::{RabbitBroker, RabbitChannel};
