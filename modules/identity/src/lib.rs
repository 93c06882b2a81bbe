pub mod command;
pub mod config;
pub mod contracts;
pub mod publisher;
pub mod subscriptions;

pub use command::{CreateUserCommand, CreateUserCommandInput, CreateUserUseCase};
pub use publisher::{UserEventPublisher, UserPublisher};
pub use subscriptions::register_subscriptions;
