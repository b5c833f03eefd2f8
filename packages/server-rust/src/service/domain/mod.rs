//! Built-in domain services.

pub mod example;

pub use example::{example_factory, ExampleService, ExampleState, EXAMPLE_FACTORY_LINK};
