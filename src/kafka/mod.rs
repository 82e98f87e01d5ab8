pub mod target;

pub use target::KafkaTarget;
