//! Survey an AWS account's serverless resources and derive their dataflow
//! graph.
//!
//! The crate is organised around one pass: the [`surveyor`] crawls the
//! account's Lambda functions, SQS queues, SNS topics, API Gateway APIs and
//! domains, S3 buckets and (optionally) CloudFormation stacks into an
//! [`inventory::Inventory`], and the [`generator`] derives deduplicated
//! node/edge collections from that inventory and writes them out as JSON.

pub mod aws;
pub mod config;
pub mod generator;
pub mod inventory;
pub mod matcher;
pub mod parallel;
pub mod surveyor;
