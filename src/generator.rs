//! Graph derivation and JSON emission.
//!
//! Pure derivation over a completed inventory: deduplicated node and edge
//! collections, plus synthetic cluster nodes for CloudFormation stacks. The
//! collections are ordered by identifier so repeated derivation over the
//! same snapshot serializes identically.

use crate::aws::arn::parse_arn;
use crate::config::Options;
use crate::inventory::{s3_bucket_arn, Inventory};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Display group of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Group {
    SnsTopic,
    SqsQueue,
    LambdaFunction,
    DomainName,
    BasePath,
    #[serde(rename = "CfStack")]
    CloudFormationStack,
    S3Bucket,
    DynamoDbTable,
}

/// Relation kind of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Relation {
    Subscriber,
    DLQ,
    Consumer,
    User,
    Interface,
    Host,
}

/// Arrow-head convention of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arrows {
    #[serde(rename = "from")]
    From,
    #[serde(rename = "to")]
    To,
    #[serde(rename = "from,to")]
    Both,
    #[serde(rename = "")]
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub label: String,
    pub group: Group,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
}

impl Node {
    fn new(id: impl Into<String>, label: impl Into<String>, group: Group) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            group,
            stack_id: None,
            stack_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub relation: Relation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrows: Option<Arrows>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_is_enabled: Option<bool>,
}

/// One node per surveyed resource, keyed (and deduplicated) by identifier.
pub fn generate_nodes(inventory: &Inventory) -> BTreeMap<String, Node> {
    let mut nodes = BTreeMap::new();

    // SNS topics
    for topic in inventory.sns_topics_by_arn.values() {
        let topic = topic.borrow();
        let resource = parse_arn(&topic.topic_arn)
            .map(|arn| arn.resource)
            .unwrap_or_else(|| topic.topic_arn.clone());
        nodes.insert(
            topic.topic_arn.clone(),
            Node::new(&topic.topic_arn, format!("topic:\n{resource}"), Group::SnsTopic),
        );
    }

    // SQS queues
    for queue in inventory.sqs_queues_by_arn.values() {
        let queue = queue.borrow();
        let resource = parse_arn(&queue.queue_arn)
            .map(|arn| arn.resource)
            .unwrap_or_else(|| queue.queue_arn.clone());
        nodes.insert(
            queue.queue_arn.clone(),
            Node::new(&queue.queue_arn, format!("queue:\n{resource}"), Group::SqsQueue),
        );
    }

    // Lambda functions
    for function in inventory.lambda_functions_by_arn.values() {
        let label = parse_arn(&function.function_arn)
            .map(|arn| arn.resource_id().to_string())
            .unwrap_or_else(|| function.function_name.clone());
        nodes.insert(
            function.function_arn.clone(),
            Node::new(&function.function_arn, label, Group::LambdaFunction),
        );
    }

    // Domain names and base path mappings
    for domain in inventory.apig_domain_names_by_name.values() {
        nodes.insert(
            domain.domain_name.clone(),
            Node::new(&domain.domain_name, &domain.domain_name, Group::DomainName),
        );
        for mapping in &domain.base_path_mappings {
            nodes.insert(
                mapping.domain_and_base_path_url.clone(),
                Node::new(
                    &mapping.domain_and_base_path_url,
                    format!("/{}", mapping.base_path_url),
                    Group::BasePath,
                ),
            );
        }
    }

    // Buckets appear only when something they notify is known
    for bucket in inventory.s3_buckets_by_arn.values() {
        if bucket.has_subscribers() {
            nodes.insert(
                bucket.bucket_arn.clone(),
                Node::new(
                    &bucket.bucket_arn,
                    format!("bucket:\n{}", bucket.name),
                    Group::S3Bucket,
                ),
            );
        }
    }

    // Tables referenced by event-source mappings
    for table in inventory.dynamodb_tables_by_arn.values() {
        nodes.insert(
            table.arn.clone(),
            Node::new(
                &table.arn,
                format!("DynamoDB table:\n{}", table.table_name),
                Group::DynamoDbTable,
            ),
        );
    }

    nodes
}

/// One edge per confirmed relation, keyed (and deduplicated) by
/// `{from}->{to}` (base-path host edges are keyed by their path node id).
pub fn generate_edges(inventory: &Inventory) -> BTreeMap<String, Edge> {
    let mut edges = BTreeMap::new();

    // SNS subscriptions whose endpoint is a known queue
    for subscription in inventory.sns_subscriptions_by_arn.values() {
        if inventory.sqs_queues_by_arn.contains_key(&subscription.endpoint) {
            edges.insert(
                format!("{}->{}", subscription.endpoint, subscription.topic_arn),
                Edge {
                    from: subscription.endpoint.clone(),
                    to: subscription.topic_arn.clone(),
                    relation: Relation::Subscriber,
                    arrows: Some(Arrows::From),
                    dashes: None,
                    state_is_enabled: None,
                },
            );
        }
    }

    // Lambda event sources, and environment variables naming other resources
    for function in inventory.lambda_functions_by_arn.values() {
        for mapping in &function.event_source_mappings {
            let enabled = mapping.is_enabled();
            let mut consumes = |target_arn: &str| {
                edges.insert(
                    format!("{}->{}", function.function_arn, target_arn),
                    Edge {
                        from: function.function_arn.clone(),
                        to: target_arn.to_string(),
                        relation: Relation::Consumer,
                        arrows: Some(Arrows::From),
                        dashes: Some(!enabled),
                        state_is_enabled: Some(enabled),
                    },
                );
            };
            if let Some(topic) = &mapping.sns_topic {
                consumes(&topic.borrow().topic_arn);
            }
            if let Some(queue) = &mapping.sqs_queue {
                consumes(&queue.borrow().queue_arn);
            }
            if let Some(table) = &mapping.dynamodb_table {
                consumes(&table.arn);
            }
        }

        for value in function.environment.values() {
            let known = inventory.sns_topics_by_arn.contains_key(value)
                || inventory.sqs_queues_by_arn.contains_key(value);
            if known {
                edges.insert(
                    format!("{}->{}", function.function_arn, value),
                    Edge {
                        from: function.function_arn.clone(),
                        to: value.clone(),
                        relation: Relation::User,
                        arrows: Some(Arrows::None),
                        dashes: Some(true),
                        state_is_enabled: None,
                    },
                );
            }
        }
    }

    // Dead-letter queues
    for queue in inventory.sqs_queues_by_arn.values() {
        let queue = queue.borrow();
        let Some(policy) = &queue.redrive_policy else {
            continue;
        };
        let target = serde_json::from_str::<serde_json::Value>(policy)
            .ok()
            .and_then(|p| {
                p.get("deadLetterTargetArn")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            });
        let Some(dlq_arn) = target else {
            tracing::debug!("Unparseable redrive policy on queue {}", queue.queue_arn);
            continue;
        };
        if inventory.sqs_queues_by_arn.contains_key(&dlq_arn) {
            edges.insert(
                format!("{dlq_arn}->{}", queue.queue_arn),
                Edge {
                    from: dlq_arn,
                    to: queue.queue_arn.clone(),
                    relation: Relation::DLQ,
                    arrows: Some(Arrows::From),
                    dashes: Some(true),
                    state_is_enabled: None,
                },
            );
        }
    }

    // Domains host base paths; base paths interface to the API's functions
    for domain in inventory.apig_domain_names_by_name.values() {
        for mapping in &domain.base_path_mappings {
            edges.insert(
                mapping.domain_and_base_path_url.clone(),
                Edge {
                    from: domain.domain_name.clone(),
                    to: mapping.domain_and_base_path_url.clone(),
                    relation: Relation::Host,
                    arrows: None,
                    dashes: None,
                    state_is_enabled: None,
                },
            );
            let api = mapping
                .rest_api_id
                .as_ref()
                .and_then(|id| inventory.apig_apis_by_id.get(id));
            if let Some(api) = api {
                for function_arn in &api.lambda_function_arns {
                    edges.insert(
                        format!("{}->{}", mapping.domain_and_base_path_url, function_arn),
                        Edge {
                            from: mapping.domain_and_base_path_url.clone(),
                            to: function_arn.clone(),
                            relation: Relation::Interface,
                            arrows: None,
                            dashes: None,
                            state_is_enabled: None,
                        },
                    );
                }
            }
        }
    }

    // Bucket notifications
    for bucket in inventory.s3_buckets_by_arn.values() {
        let subscribers = bucket
            .notify_lambda_function_arns
            .iter()
            .chain(&bucket.notify_sns_topic_arns)
            .chain(&bucket.notify_sqs_queue_arns);
        for consumer_arn in subscribers {
            edges.insert(
                format!("{consumer_arn}->{}", bucket.bucket_arn),
                Edge {
                    from: consumer_arn.clone(),
                    to: bucket.bucket_arn.clone(),
                    relation: Relation::Consumer,
                    arrows: Some(Arrows::From),
                    dashes: None,
                    state_is_enabled: None,
                },
            );
        }
    }

    edges
}

/// Attributes stack membership onto matching nodes and returns one synthetic
/// cluster node per stack that claimed at least one node.
pub fn generate_stack_clusters(
    inventory: &Inventory,
    nodes: &mut BTreeMap<String, Node>,
) -> BTreeMap<String, Node> {
    let mut clusters = BTreeMap::new();

    for stack in inventory.cf_stacks_by_id.values() {
        let stack_arn = parse_arn(&stack.stack_id);
        for resource in &stack.resources {
            let member_arn = match resource.resource_type.as_str() {
                "AWS::Lambda::Function" => stack_arn.as_ref().map(|arn| {
                    format!(
                        "arn:{}:lambda:{}:{}:function:{}",
                        arn.partition, arn.region, arn.account_id, resource.physical_resource_id
                    )
                }),
                "AWS::SQS::Queue" => inventory
                    .sqs_queues_by_url
                    .get(&resource.physical_resource_id)
                    .map(|queue| queue.borrow().queue_arn.clone())
                    .or_else(|| convert_sqs_url_to_arn(&resource.physical_resource_id)),
                "AWS::SNS::Topic" => Some(resource.physical_resource_id.clone()),
                "AWS::DynamoDB::Table" => stack_arn.as_ref().map(|arn| {
                    format!(
                        "arn:{}:dynamodb:{}:{}:table/{}",
                        arn.partition, arn.region, arn.account_id, resource.physical_resource_id
                    )
                }),
                "AWS::S3::Bucket" => Some(s3_bucket_arn(&resource.physical_resource_id)),
                _ => None,
            };

            let node = member_arn.and_then(|arn| nodes.get_mut(&arn));
            if let Some(node) = node {
                node.stack_id = Some(stack.stack_id.clone());
                node.stack_name = Some(stack.stack_name.clone());
                clusters.insert(
                    stack.stack_id.clone(),
                    Node::new(
                        &stack.stack_id,
                        &stack.stack_name,
                        Group::CloudFormationStack,
                    ),
                );
            }
        }
    }

    clusters
}

/// Textual queue URL to ARN conversion, used when the queue is not (or no
/// longer) in the inventory.
pub fn convert_sqs_url_to_arn(queue_url: &str) -> Option<String> {
    let parsed = url::Url::parse(queue_url).ok()?;
    let host = parsed.host_str()?;
    let mut host_parts = host.split('.');
    if host_parts.next()? != "sqs" {
        return None;
    }
    let region = host_parts.next()?;
    let mut segments = parsed.path_segments()?;
    let account_id = segments.next()?;
    let queue_name = segments.next()?;
    if account_id.is_empty() || queue_name.is_empty() {
        return None;
    }
    Some(format!("arn:aws:sqs:{region}:{account_id}:{queue_name}"))
}

pub struct Generator<'a> {
    options: &'a Options,
}

impl<'a> Generator<'a> {
    pub fn new(options: &'a Options) -> Self {
        Self { options }
    }

    /// Derives the graph and writes `nodes.json`, `edges.json`,
    /// `clusters.json` and `meta.json` under the output path.
    pub fn generate(&self, inventory: &Inventory) -> Result<()> {
        let dest = Path::new(&self.options.output_path);
        tracing::info!("Generating graph data in '{}'", dest.display());

        let mut nodes = generate_nodes(inventory);
        let edges = generate_edges(inventory);
        let clusters = generate_stack_clusters(inventory, &mut nodes);

        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create output directory '{}'", dest.display()))?;

        write_json(&dest.join("nodes.json"), &nodes.values().collect::<Vec<_>>())?;
        write_json(&dest.join("edges.json"), &edges.values().collect::<Vec<_>>())?;
        write_json(
            &dest.join("clusters.json"),
            &clusters.values().collect::<Vec<_>>(),
        )?;
        write_json(
            &dest.join("meta.json"),
            &json!({
                "commandLine": self.options.command_line,
                "region": self.options.region,
                "generatedAt": chrono::Utc::now().to_rfc3339(),
            }),
        )?;
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize graph data")?;
    fs::write(path, content).with_context(|| format!("Failed to write '{}'", path.display()))
}
