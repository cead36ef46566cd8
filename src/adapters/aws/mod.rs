//! AWS adapters: SQS task queue, S3 object store, DynamoDB video records.

pub mod dynamodb;
pub mod s3;
pub mod sqs;

pub use dynamodb::DynamoAdapter;
pub use s3::S3Adapter;
pub use sqs::SqsAdapter;
