//! The in-memory inventory of surveyed resources.
//!
//! One keyed mapping per resource family, populated by the surveyors during
//! the survey phase and read by the graph builder afterwards. Queue records
//! are kept under both their URL and their ARN; both keys hold the same
//! shared instance, so a mutation through either view is visible through the
//! other. Maps are ordered so graph derivation is deterministic across runs.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

pub type SharedQueue = Rc<RefCell<SqsQueueDetails>>;
pub type SharedTopic = Rc<RefCell<SnsTopicDetails>>;
pub type SharedTable = Rc<DynamoDbTableDetails>;
pub type SharedStack = Rc<CloudFormationStackDetails>;

fn required_str(value: &Value, field: &str, what: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{what} is missing required field {field}"))
}

pub fn optional_str(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// One SNS subscription, combining its listing entry with its fetched
/// attribute map.
#[derive(Debug, Clone)]
pub struct SnsSubscriptionDetails {
    pub subscription_arn: String,
    pub topic_arn: String,
    pub endpoint: String,
    pub protocol: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl SnsSubscriptionDetails {
    pub fn from_parts(subscription: &Value, attributes: &Value) -> Result<Self> {
        Ok(Self {
            subscription_arn: required_str(subscription, "SubscriptionArn", "SNS subscription")?,
            topic_arn: required_str(subscription, "TopicArn", "SNS subscription")?,
            endpoint: required_str(subscription, "Endpoint", "SNS subscription")?,
            protocol: optional_str(subscription, "Protocol"),
            attributes: string_map(Some(attributes)),
        })
    }
}

/// One SNS topic and the subscriptions attached to it during the survey.
#[derive(Debug, Clone)]
pub struct SnsTopicDetails {
    pub topic_arn: String,
    pub attributes: BTreeMap<String, String>,
    pub subscriptions: Vec<SnsSubscriptionDetails>,
}

impl SnsTopicDetails {
    pub fn from_attributes(topic_arn: &str, attributes: &Value) -> Self {
        Self {
            topic_arn: topic_arn.to_string(),
            attributes: string_map(Some(attributes)),
            subscriptions: Vec::new(),
        }
    }
}

/// One SQS queue. `queue_arn` comes from the attribute map and is required;
/// the raw attributes are kept alongside the fields the graph needs.
#[derive(Debug, Clone)]
pub struct SqsQueueDetails {
    pub queue_url: String,
    pub queue_arn: String,
    pub redrive_policy: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub subscriptions: Vec<SnsSubscriptionDetails>,
}

impl SqsQueueDetails {
    pub fn from_attributes(queue_url: &str, attributes: &Value) -> Result<Self> {
        let attributes = string_map(Some(attributes));
        let queue_arn = attributes
            .get("QueueArn")
            .cloned()
            .ok_or_else(|| anyhow!("SQS queue {queue_url} is missing required attribute QueueArn"))?;
        Ok(Self {
            queue_url: queue_url.to_string(),
            queue_arn,
            redrive_policy: attributes.get("RedrivePolicy").cloned(),
            attributes,
            subscriptions: Vec::new(),
        })
    }
}

/// Minimal DynamoDB table record, created lazily when an event-source
/// mapping references one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoDbTableDetails {
    pub arn: String,
    pub table_name: String,
}

/// One Lambda event-source mapping with its resolved target, if the target
/// is known to the inventory. Unresolved targets stay `None`.
#[derive(Debug, Clone)]
pub struct EventSourceMappingDetails {
    pub event_source_arn: Option<String>,
    pub state: Option<String>,
    pub sns_topic: Option<SharedTopic>,
    pub sqs_queue: Option<SharedQueue>,
    pub dynamodb_table: Option<SharedTable>,
}

impl EventSourceMappingDetails {
    pub fn is_enabled(&self) -> bool {
        self.state.as_deref() == Some("Enabled")
    }
}

/// One Lambda function configuration plus its event-source mappings.
#[derive(Debug, Clone)]
pub struct LambdaFunctionDetails {
    pub function_arn: String,
    pub function_name: String,
    pub environment: BTreeMap<String, String>,
    pub event_source_mappings: Vec<EventSourceMappingDetails>,
}

impl LambdaFunctionDetails {
    pub fn from_configuration(
        configuration: &Value,
        event_source_mappings: Vec<EventSourceMappingDetails>,
    ) -> Result<Self> {
        let function_arn = required_str(configuration, "FunctionArn", "Lambda function")?;
        let function_name = optional_str(configuration, "FunctionName")
            .unwrap_or_else(|| function_arn.clone());
        Ok(Self {
            function_arn,
            function_name,
            environment: string_map(
                configuration
                    .get("Environment")
                    .and_then(|e| e.get("Variables")),
            ),
            event_source_mappings,
        })
    }
}

/// One route integration of an API Gateway API.
#[derive(Debug, Clone)]
pub struct IntegrationDetails {
    pub http_method: String,
    pub integration_type: Option<String>,
    pub uri: Option<String>,
    pub lambda_function_arn: Option<String>,
}

/// One API Gateway resource and its per-method integrations.
#[derive(Debug, Clone)]
pub struct RouteDetails {
    pub path: String,
    pub integrations: Vec<IntegrationDetails>,
}

/// One API Gateway REST API, with the set of Lambda functions its routes
/// invoke.
#[derive(Debug, Clone)]
pub struct ApiGatewayApiDetails {
    pub id: String,
    pub name: Option<String>,
    pub lambda_function_arns: BTreeSet<String>,
    pub routes: Vec<RouteDetails>,
}

/// One base-path mapping of a custom domain. `base_path_url` is the raw
/// base path with the `(none)` placeholder collapsed to an empty string;
/// `domain_and_base_path_url` is the node identifier `{domain}/{base path}`.
#[derive(Debug, Clone)]
pub struct BasePathMappingDetails {
    pub base_path: String,
    pub base_path_url: String,
    pub domain_and_base_path_url: String,
    pub rest_api_id: Option<String>,
}

impl BasePathMappingDetails {
    pub fn from_mapping(domain_name: &str, mapping: &Value) -> Result<Self> {
        let base_path = required_str(mapping, "basePath", "base path mapping")?;
        let base_path_url = if base_path == "(none)" {
            String::new()
        } else {
            base_path.clone()
        };
        Ok(Self {
            domain_and_base_path_url: format!("{domain_name}/{base_path_url}"),
            base_path,
            base_path_url,
            rest_api_id: optional_str(mapping, "restApiId"),
        })
    }
}

/// One API Gateway custom domain and its base-path mappings.
#[derive(Debug, Clone)]
pub struct DomainNameDetails {
    pub domain_name: String,
    pub base_path_mappings: Vec<BasePathMappingDetails>,
}

/// One S3 bucket with the subscriber identifiers derived from its
/// notification configuration (only identifiers already known to the
/// inventory are retained).
#[derive(Debug, Clone)]
pub struct S3BucketDetails {
    pub name: String,
    pub bucket_arn: String,
    pub notify_lambda_function_arns: BTreeSet<String>,
    pub notify_sqs_queue_arns: BTreeSet<String>,
    pub notify_sns_topic_arns: BTreeSet<String>,
}

impl S3BucketDetails {
    pub fn new(
        name: &str,
        notify_lambda_function_arns: BTreeSet<String>,
        notify_sqs_queue_arns: BTreeSet<String>,
        notify_sns_topic_arns: BTreeSet<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            bucket_arn: s3_bucket_arn(name),
            notify_lambda_function_arns,
            notify_sqs_queue_arns,
            notify_sns_topic_arns,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.notify_lambda_function_arns.is_empty()
            || !self.notify_sqs_queue_arns.is_empty()
            || !self.notify_sns_topic_arns.is_empty()
    }
}

/// Synthetic bucket identifier. Not a real ARN; an internal graph-linking
/// convention that has to stay consistent between the bucket surveyor and
/// stack attribution.
pub fn s3_bucket_arn(name: &str) -> String {
    format!("arn::s3:::{name}")
}

/// One member resource of a CloudFormation stack.
#[derive(Debug, Clone)]
pub struct StackResourceSummary {
    pub resource_type: String,
    pub physical_resource_id: String,
}

impl StackResourceSummary {
    pub fn from_summary(summary: &Value) -> Result<Self> {
        Ok(Self {
            resource_type: required_str(summary, "ResourceType", "stack resource")?,
            physical_resource_id: required_str(summary, "PhysicalResourceId", "stack resource")?,
        })
    }
}

/// One CloudFormation stack and its member-resource summaries.
#[derive(Debug, Clone)]
pub struct CloudFormationStackDetails {
    pub stack_name: String,
    pub stack_id: String,
    pub resources: Vec<StackResourceSummary>,
}

/// The aggregate store for one survey run.
#[derive(Debug, Default)]
pub struct Inventory {
    pub cf_stacks_by_name: BTreeMap<String, SharedStack>,
    pub cf_stacks_by_id: BTreeMap<String, SharedStack>,
    pub lambda_functions_by_arn: BTreeMap<String, LambdaFunctionDetails>,
    pub sns_topics_by_arn: BTreeMap<String, SharedTopic>,
    pub sns_subscriptions_by_arn: BTreeMap<String, SnsSubscriptionDetails>,
    pub sqs_queues_by_url: BTreeMap<String, SharedQueue>,
    pub sqs_queues_by_arn: BTreeMap<String, SharedQueue>,
    pub s3_buckets_by_arn: BTreeMap<String, S3BucketDetails>,
    pub dynamodb_tables_by_arn: BTreeMap<String, SharedTable>,
    pub apig_apis_by_id: BTreeMap<String, ApiGatewayApiDetails>,
    pub apig_domain_names_by_name: BTreeMap<String, DomainNameDetails>,
}

impl Inventory {
    /// Inserts a queue under both its URL and its ARN key. Both keys point
    /// at the same shared instance.
    pub fn insert_queue(&mut self, queue: SqsQueueDetails) -> SharedQueue {
        let queue_url = queue.queue_url.clone();
        let queue_arn = queue.queue_arn.clone();
        let shared = Rc::new(RefCell::new(queue));
        self.sqs_queues_by_url.insert(queue_url, Rc::clone(&shared));
        self.sqs_queues_by_arn.insert(queue_arn, Rc::clone(&shared));
        shared
    }

    pub fn insert_topic(&mut self, topic: SnsTopicDetails) -> SharedTopic {
        let topic_arn = topic.topic_arn.clone();
        let shared = Rc::new(RefCell::new(topic));
        self.sns_topics_by_arn.insert(topic_arn, Rc::clone(&shared));
        shared
    }

    /// Inserts a stack under both its name and its id key.
    pub fn insert_stack(&mut self, stack: CloudFormationStackDetails) -> SharedStack {
        let shared = Rc::new(stack);
        self.cf_stacks_by_name
            .insert(shared.stack_name.clone(), Rc::clone(&shared));
        self.cf_stacks_by_id
            .insert(shared.stack_id.clone(), Rc::clone(&shared));
        shared
    }

    /// Returns the table record for `arn`, creating it on first reference.
    pub fn table_for_arn(&mut self, arn: &str, table_name: &str) -> SharedTable {
        Rc::clone(
            self.dynamodb_tables_by_arn
                .entry(arn.to_string())
                .or_insert_with(|| {
                    Rc::new(DynamoDbTableDetails {
                        arn: arn.to_string(),
                        table_name: table_name.to_string(),
                    })
                }),
        )
    }
}
