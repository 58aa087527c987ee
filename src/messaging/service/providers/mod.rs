//! Queue backend implementations.

mod in_memory;
mod rabbitmq;
mod redis_streams;

pub use in_memory::InMemoryQueueService;
pub use rabbitmq::RabbitMqQueueService;
pub use redis_streams::RedisStreamsQueueService;
