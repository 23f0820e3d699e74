//! Resource surveyors.
//!
//! One survey per resource family: paginated listing filtered eagerly
//! through the matcher, detail fetches fanned out through the
//! bounded-concurrency executor, then insertion and cross-linking into the
//! inventory. Families without data dependencies run concurrently (API
//! Gateway with SQS, CloudFormation with everything); dependent families
//! run in sequence (topics before subscriptions before Lambda event-source
//! linkage, buckets after functions/queues/topics are known).

use crate::aws::arn::parse_arn;
use crate::aws::client::AwsClient;
use crate::aws::http::as_api_error;
use crate::aws::paging::{self, MARKER, NEXT_TOKEN, POSITION};
use crate::aws::retry;
use crate::config::Options;
use crate::inventory::{
    optional_str, ApiGatewayApiDetails, BasePathMappingDetails, CloudFormationStackDetails,
    DomainNameDetails, EventSourceMappingDetails, IntegrationDetails, Inventory,
    LambdaFunctionDetails, RouteDetails, S3BucketDetails, SnsSubscriptionDetails, SnsTopicDetails,
    SqsQueueDetails, StackResourceSummary,
};
use crate::matcher::{build_include_exclude_matcher, Matcher};
use crate::parallel::in_parallel;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Instant;

pub struct Surveyor<'a> {
    client: &'a AwsClient,
    options: &'a Options,
    matcher: Matcher,
}

impl<'a> Surveyor<'a> {
    pub fn new(client: &'a AwsClient, options: &'a Options) -> Result<Self> {
        let matcher = build_include_exclude_matcher(&options.include, &options.exclude)?;
        Ok(Self {
            client,
            options,
            matcher,
        })
    }

    /// Runs the whole survey into `inventory`. The CloudFormation survey
    /// (when enabled) runs concurrently with the main phase chain and its
    /// results are merged at the end.
    pub async fn survey(&self, inventory: &mut Inventory) -> Result<()> {
        let started = Instant::now();
        let phases = if self.options.cloud_formation { 5 } else { 4 };

        let cloud_formation = async {
            if self.options.cloud_formation {
                self.survey_cloud_formation().await
            } else {
                Ok(Vec::new())
            }
        };

        let main = async {
            tracing::info!("(1/{phases}) Surveying API Gateway and SQS");
            let ((domains, apis), queues) =
                tokio::try_join!(self.survey_api_gateway(), self.survey_sqs())?;
            for queue in queues {
                inventory.insert_queue(queue);
            }
            for domain in domains {
                inventory
                    .apig_domain_names_by_name
                    .insert(domain.domain_name.clone(), domain);
            }
            for api in apis {
                inventory.apig_apis_by_id.insert(api.id.clone(), api);
            }

            tracing::info!("(2/{phases}) Surveying SNS");
            self.survey_sns(inventory).await?;

            tracing::info!("(3/{phases}) Surveying Lambda");
            self.survey_lambda(inventory).await?;

            tracing::info!("(4/{phases}) Surveying S3");
            self.survey_s3(inventory).await?;
            Ok::<(), anyhow::Error>(())
        };

        let (stacks, ()) = tokio::try_join!(cloud_formation, main)?;
        if self.options.cloud_formation {
            tracing::info!("(5/{phases}) Collecting CloudFormation survey results");
            for stack in stacks {
                inventory.insert_stack(stack);
            }
        }

        tracing::info!(
            "Finished survey in {:.1} seconds",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn survey_api_gateway(&self) -> Result<(Vec<DomainNameDetails>, Vec<ApiGatewayApiDetails>)> {
        let parallelism = self.options.parallelism();

        // Domain names
        let domain_objects = paging::fetch_all_pages(POSITION, "item", |cursor| {
            let path = format!(
                "/domainnames?limit=100{}",
                POSITION.query(cursor.as_deref())
            );
            async move { self.client.get("apigateway", &path).await }
        })
        .await
        .context("Failed to list API Gateway domain names")?;

        let included_domains: Vec<String> = domain_objects
            .iter()
            .filter_map(|d| d.get("domainName").and_then(Value::as_str))
            .filter(|name| self.matcher.matches(name))
            .map(str::to_string)
            .collect();

        let domains = in_parallel(parallelism, included_domains, |domain_name| async move {
            let mappings = paging::fetch_all_pages(POSITION, "item", |cursor| {
                let path = format!(
                    "/domainnames/{}/basepathmappings?limit=500{}",
                    urlencoding::encode(&domain_name),
                    POSITION.query(cursor.as_deref())
                );
                async move { self.client.get("apigateway", &path).await }
            })
            .await
            .with_context(|| format!("Failed to list base path mappings of {domain_name}"))?;

            let base_path_mappings = mappings
                .iter()
                .map(|mapping| BasePathMappingDetails::from_mapping(&domain_name, mapping))
                .collect::<Result<Vec<_>>>()?;
            Ok(DomainNameDetails {
                domain_name,
                base_path_mappings,
            })
        })
        .await?;
        tracing::info!(
            "Surveyed {}/{} domains in API Gateway",
            domains.len(),
            domain_objects.len()
        );

        // REST APIs
        let rest_apis = paging::fetch_all_pages(POSITION, "item", |cursor| {
            let path = format!("/restapis?limit=100{}", POSITION.query(cursor.as_deref()));
            async move { self.client.get("apigateway", &path).await }
        })
        .await
        .context("Failed to list API Gateway REST APIs")?;
        let api_count = rest_apis.len();

        let apis = in_parallel(parallelism, rest_apis, |rest_api| async move {
            let rest_api_id = optional_str(&rest_api, "id")
                .ok_or_else(|| anyhow!("API Gateway REST API is missing required field id"))?;

            let resources = paging::fetch_all_pages(POSITION, "item", |cursor| {
                let path = format!(
                    "/restapis/{rest_api_id}/resources?limit=100{}",
                    POSITION.query(cursor.as_deref())
                );
                async move { self.client.get("apigateway", &path).await }
            })
            .await
            .with_context(|| format!("Failed to list resources of REST API {rest_api_id}"))?;

            let mut lambda_function_arns = BTreeSet::new();
            let mut routes = Vec::new();
            for resource in &resources {
                let resource_id = optional_str(resource, "id").ok_or_else(|| {
                    anyhow!("resource of REST API {rest_api_id} is missing required field id")
                })?;
                let path = optional_str(resource, "path").unwrap_or_else(|| "/".to_string());

                let mut integrations = Vec::new();
                if let Some(methods) = resource.get("resourceMethods").and_then(Value::as_object) {
                    for http_method in methods.keys() {
                        let integration = retry::with_backoff(|| {
                            let path = format!(
                                "/restapis/{rest_api_id}/resources/{resource_id}/methods/{http_method}/integration"
                            );
                            async move { self.client.get("apigateway", &path).await }
                        })
                        .await
                        .with_context(|| {
                            format!("Failed to fetch {http_method} integration of {rest_api_id} {path}")
                        })?;

                        let integration_type = optional_str(&integration, "type");
                        let uri = optional_str(&integration, "uri");
                        // MOCK integrations never count as a function link.
                        let lambda_function_arn = if integration_type.as_deref() == Some("MOCK") {
                            None
                        } else {
                            uri.as_deref().and_then(lambda_arn_from_integration_uri)
                        };
                        if let Some(arn) = &lambda_function_arn {
                            lambda_function_arns.insert(arn.clone());
                        }
                        integrations.push(IntegrationDetails {
                            http_method: http_method.clone(),
                            integration_type,
                            uri,
                            lambda_function_arn,
                        });
                    }
                }
                routes.push(RouteDetails { path, integrations });
            }

            Ok(ApiGatewayApiDetails {
                name: optional_str(&rest_api, "name"),
                id: rest_api_id,
                lambda_function_arns,
                routes,
            })
        })
        .await?;
        tracing::info!("Surveyed {api_count} APIs in API Gateway");

        Ok((domains, apis))
    }

    async fn survey_sqs(&self) -> Result<Vec<SqsQueueDetails>> {
        let parallelism = self.options.parallelism();

        let queue_urls = paging::fetch_all_pages(NEXT_TOKEN, "QueueUrls", |cursor| {
            let mut payload = json!({});
            NEXT_TOKEN.apply(&mut payload, cursor.as_deref());
            async move {
                self.client
                    .post_target("sqs", "AmazonSQS.ListQueues", &payload)
                    .await
            }
        })
        .await
        .context("Failed to list SQS queues")?;

        let urls: Vec<String> = queue_urls
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        let total = urls.len();

        // The queue ARN only becomes known with the attributes, so the
        // filter applies after the detail fetch here.
        let fetched = in_parallel(parallelism, urls, |queue_url| async move {
            let response = retry::with_backoff(|| {
                let payload = json!({ "QueueUrl": queue_url, "AttributeNames": ["All"] });
                async move {
                    self.client
                        .post_target("sqs", "AmazonSQS.GetQueueAttributes", &payload)
                        .await
                }
            })
            .await
            .with_context(|| format!("Failed to fetch attributes of queue {queue_url}"))?;
            let attributes = response.get("Attributes").cloned().unwrap_or_else(|| json!({}));
            SqsQueueDetails::from_attributes(&queue_url, &attributes)
        })
        .await?;

        let queues: Vec<SqsQueueDetails> = fetched
            .into_iter()
            .filter(|queue| self.matcher.matches(&queue.queue_arn))
            .collect();
        tracing::info!("Surveyed {}/{} queues in SQS", queues.len(), total);
        Ok(queues)
    }

    async fn survey_sns(&self, inventory: &mut Inventory) -> Result<()> {
        let parallelism = self.options.parallelism();

        // Topics
        let topics = paging::fetch_all_pages(NEXT_TOKEN, "Topics", |cursor| {
            let mut payload = json!({});
            NEXT_TOKEN.apply(&mut payload, cursor.as_deref());
            async move {
                self.client
                    .post_target("sns", "AmazonSNS.ListTopics", &payload)
                    .await
            }
        })
        .await
        .context("Failed to list SNS topics")?;
        let total_topics = topics.len();

        let included_topics: Vec<String> = topics
            .iter()
            .filter_map(|t| t.get("TopicArn").and_then(Value::as_str))
            .filter(|arn| self.matcher.matches(arn))
            .map(str::to_string)
            .collect();

        let topic_details = in_parallel(parallelism, included_topics, |topic_arn| async move {
            let response = retry::with_backoff(|| {
                let payload = json!({ "TopicArn": topic_arn });
                async move {
                    self.client
                        .post_target("sns", "AmazonSNS.GetTopicAttributes", &payload)
                        .await
                }
            })
            .await
            .with_context(|| format!("Failed to fetch attributes of topic {topic_arn}"))?;
            let attributes = response.get("Attributes").cloned().unwrap_or_else(|| json!({}));
            Ok(SnsTopicDetails::from_attributes(&topic_arn, &attributes))
        })
        .await?;
        for topic in topic_details {
            inventory.insert_topic(topic);
        }
        tracing::info!(
            "Surveyed {}/{} topics in SNS",
            inventory.sns_topics_by_arn.len(),
            total_topics
        );

        // Subscriptions
        let subscriptions = paging::fetch_all_pages(NEXT_TOKEN, "Subscriptions", |cursor| {
            let mut payload = json!({});
            NEXT_TOKEN.apply(&mut payload, cursor.as_deref());
            async move {
                self.client
                    .post_target("sns", "AmazonSNS.ListSubscriptions", &payload)
                    .await
            }
        })
        .await
        .context("Failed to list SNS subscriptions")?;
        let total_subscriptions = subscriptions.len();

        let relevant: Vec<Value> = subscriptions
            .into_iter()
            .filter(|sub| {
                sub.get("TopicArn")
                    .and_then(Value::as_str)
                    .map_or(false, |arn| self.matcher.matches(arn))
            })
            .collect();

        let fetched = in_parallel(parallelism, relevant, |subscription| async move {
            let subscription_arn = optional_str(&subscription, "SubscriptionArn")
                .ok_or_else(|| anyhow!("SNS subscription is missing required field SubscriptionArn"))?;
            let result = retry::with_backoff(|| {
                let payload = json!({ "SubscriptionArn": subscription_arn });
                async move {
                    self.client
                        .post_target("sns", "AmazonSNS.GetSubscriptionAttributes", &payload)
                        .await
                }
            })
            .await;
            match result {
                Ok(response) => {
                    let attributes =
                        response.get("Attributes").cloned().unwrap_or_else(|| json!({}));
                    Ok(Some(SnsSubscriptionDetails::from_parts(
                        &subscription,
                        &attributes,
                    )?))
                }
                // Listings lag behind deletions; a subscription that is gone
                // (or still pending) by detail-fetch time is dropped.
                Err(error)
                    if as_api_error(&error)
                        .is_some_and(|e| (e.status == 404 || e.status == 400) && !e.is_throttling()) =>
                {
                    tracing::debug!("Ignoring zombie or pending subscription {subscription_arn}");
                    Ok(None)
                }
                Err(error) => Err(error),
            }
        })
        .await?;

        for subscription in fetched.into_iter().flatten() {
            if let Some(topic) = inventory.sns_topics_by_arn.get(&subscription.topic_arn) {
                topic.borrow_mut().subscriptions.push(subscription.clone());
            }
            if let Some(queue) = inventory.sqs_queues_by_arn.get(&subscription.endpoint) {
                queue.borrow_mut().subscriptions.push(subscription.clone());
            }
            inventory
                .sns_subscriptions_by_arn
                .insert(subscription.subscription_arn.clone(), subscription);
        }
        tracing::info!(
            "Surveyed {}/{} subscriptions in SNS",
            inventory.sns_subscriptions_by_arn.len(),
            total_subscriptions
        );
        Ok(())
    }

    async fn survey_lambda(&self, inventory: &mut Inventory) -> Result<()> {
        let parallelism = dampened_parallelism(self.options.parallelism());

        let configurations = paging::fetch_all_pages(MARKER, "Functions", |cursor| {
            let path = format!(
                "/2015-03-31/functions?MaxItems=50{}",
                MARKER.query(cursor.as_deref())
            );
            async move { self.client.get("lambda", &path).await }
        })
        .await
        .context("Failed to list Lambda functions")?;
        let total = configurations.len();

        let included: Vec<Value> = configurations
            .into_iter()
            .filter(|c| {
                c.get("FunctionArn")
                    .and_then(Value::as_str)
                    .map_or(false, |arn| self.matcher.matches(arn))
            })
            .collect();

        let fetched = in_parallel(parallelism, included, |configuration| async move {
            let function_arn = optional_str(&configuration, "FunctionArn")
                .ok_or_else(|| anyhow!("Lambda function is missing required field FunctionArn"))?;
            let mappings = paging::fetch_all_pages(MARKER, "EventSourceMappings", |cursor| {
                let path = format!(
                    "/2015-03-31/event-source-mappings?FunctionName={}{}",
                    urlencoding::encode(&function_arn),
                    MARKER.query(cursor.as_deref())
                );
                async move { self.client.get("lambda", &path).await }
            })
            .await
            .with_context(|| format!("Failed to list event source mappings of {function_arn}"))?;
            Ok((configuration, mappings))
        })
        .await?;

        let mut surveyed = 0usize;
        for (configuration, raw_mappings) in fetched {
            let event_source_mappings = raw_mappings
                .iter()
                .map(|raw| self.resolve_event_source_mapping(inventory, &configuration, raw))
                .collect();
            let function =
                LambdaFunctionDetails::from_configuration(&configuration, event_source_mappings)?;
            inventory
                .lambda_functions_by_arn
                .insert(function.function_arn.clone(), function);
            surveyed += 1;
        }
        tracing::info!("Surveyed {surveyed}/{total} functions in Lambda");
        Ok(())
    }

    /// Resolves an event-source mapping against the already-surveyed
    /// topics/queues, creating table records on first reference. Unresolved
    /// and unrecognized sources stay unlinked.
    fn resolve_event_source_mapping(
        &self,
        inventory: &mut Inventory,
        configuration: &Value,
        raw: &Value,
    ) -> EventSourceMappingDetails {
        let event_source_arn = optional_str(raw, "EventSourceArn");
        let state = optional_str(raw, "State");

        let mut sns_topic = None;
        let mut sqs_queue = None;
        let mut dynamodb_table = None;
        match event_source_arn.as_deref() {
            Some(arn) if arn.contains(":sns:") => {
                sns_topic = inventory.sns_topics_by_arn.get(arn).cloned();
            }
            Some(arn) if arn.contains(":sqs:") => {
                sqs_queue = inventory.sqs_queues_by_arn.get(arn).cloned();
            }
            Some(arn) if arn.contains(":dynamodb:") => {
                let table_arn = arn.split("/stream/").next().unwrap_or(arn);
                if let Some(parsed) = parse_arn(table_arn) {
                    dynamodb_table =
                        Some(inventory.table_for_arn(&parsed.arn, parsed.resource_id()));
                }
            }
            Some(arn) => {
                tracing::debug!(
                    "Ignoring event source {arn} for Lambda function {}",
                    optional_str(configuration, "FunctionName").unwrap_or_default()
                );
            }
            None => {}
        }

        EventSourceMappingDetails {
            event_source_arn,
            state,
            sns_topic,
            sqs_queue,
            dynamodb_table,
        }
    }

    async fn survey_s3(&self, inventory: &mut Inventory) -> Result<()> {
        let parallelism = self.options.parallelism();

        let response = retry::with_backoff(|| async { self.client.get("s3", "/").await })
            .await
            .context("Failed to list S3 buckets")?;
        let buckets = response
            .get("Buckets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = buckets.len();

        let included: Vec<String> = buckets
            .iter()
            .filter_map(|b| b.get("Name").and_then(Value::as_str))
            .filter(|name| self.matcher.matches(name))
            .map(str::to_string)
            .collect();

        let fetched = in_parallel(parallelism, included, |name| async move {
            let configuration = retry::with_backoff(|| {
                let path = format!("/{}?notification", urlencoding::encode(&name));
                async move { self.client.get("s3", &path).await }
            })
            .await
            .with_context(|| format!("Failed to fetch notification configuration of bucket {name}"))?;
            Ok((name, configuration))
        })
        .await?;

        for (name, configuration) in fetched {
            let bucket = S3BucketDetails::new(
                &name,
                known_notification_arns(
                    &configuration,
                    "LambdaFunctionConfigurations",
                    "LambdaFunctionArn",
                    |arn| inventory.lambda_functions_by_arn.contains_key(arn),
                ),
                known_notification_arns(&configuration, "QueueConfigurations", "QueueArn", |arn| {
                    inventory.sqs_queues_by_arn.contains_key(arn)
                }),
                known_notification_arns(&configuration, "TopicConfigurations", "TopicArn", |arn| {
                    inventory.sns_topics_by_arn.contains_key(arn)
                }),
            );
            inventory
                .s3_buckets_by_arn
                .insert(bucket.bucket_arn.clone(), bucket);
        }
        tracing::info!(
            "Surveyed {}/{} buckets in S3",
            inventory.s3_buckets_by_arn.len(),
            total
        );
        Ok(())
    }

    async fn survey_cloud_formation(&self) -> Result<Vec<CloudFormationStackDetails>> {
        let stacks = paging::fetch_all_pages(NEXT_TOKEN, "StackSummaries", |cursor| {
            let mut payload = json!({});
            NEXT_TOKEN.apply(&mut payload, cursor.as_deref());
            async move {
                self.client
                    .post_target("cloudformation", "CloudFormation.ListStacks", &payload)
                    .await
            }
        })
        .await
        .context("Failed to list CloudFormation stacks")?;
        let total = stacks.len();

        // The stack APIs throttle aggressively; survey them one at a time.
        let mut details = Vec::new();
        for stack in &stacks {
            let Some(stack_id) = optional_str(stack, "StackId") else {
                continue;
            };
            if !self.matcher.matches(&stack_id) {
                continue;
            }
            let stack_name = optional_str(stack, "StackName")
                .ok_or_else(|| anyhow!("CloudFormation stack is missing required field StackName"))?;

            let resources = match paging::fetch_all_pages(NEXT_TOKEN, "StackResourceSummaries", |cursor| {
                let mut payload = json!({ "StackName": stack_id });
                NEXT_TOKEN.apply(&mut payload, cursor.as_deref());
                async move {
                    self.client
                        .post_target("cloudformation", "CloudFormation.ListStackResources", &payload)
                        .await
                }
            })
            .await
            {
                Ok(items) => items
                    .iter()
                    .map(StackResourceSummary::from_summary)
                    .collect::<Result<Vec<_>>>()?,
                Err(error)
                    if as_api_error(&error)
                        .is_some_and(|e| e.is_client_error() && !e.is_throttling()) =>
                {
                    tracing::debug!("Ignoring resources of CloudFormation stack {stack_id}: {error:#}");
                    Vec::new()
                }
                Err(error) => return Err(error),
            };

            details.push(CloudFormationStackDetails {
                stack_name,
                stack_id,
                resources,
            });
        }
        tracing::info!("Surveyed {}/{} stacks in CloudFormation", details.len(), total);
        Ok(details)
    }
}

/// A gateway integration URI counts as a function reference only when it
/// points at a Lambda `invocations` endpoint.
pub fn lambda_arn_from_integration_uri(uri: &str) -> Option<String> {
    let start = uri.rfind("/functions/arn:")? + "/functions/".len();
    let arn = uri.get(start..)?.strip_suffix("/invocations")?;
    if !arn.contains(":lambda:") {
        return None;
    }
    Some(arn.to_string())
}

/// The Lambda control plane rate-limits far below the other services, so its
/// survey runs with a dampened concurrency.
fn dampened_parallelism(parallelism: usize) -> usize {
    1 + ((parallelism as f64).sqrt().sqrt() / 1.4).floor() as usize
}

fn known_notification_arns(
    configuration: &Value,
    rules_field: &str,
    arn_field: &str,
    known: impl Fn(&str) -> bool,
) -> BTreeSet<String> {
    configuration
        .get(rules_field)
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(|rule| rule.get(arn_field).and_then(Value::as_str))
                .filter(|arn| known(arn))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
