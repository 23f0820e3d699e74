//! End-to-end survey tests against mocked service endpoints.
//!
//! The whole survey runs against one wiremock server standing in for every
//! service (the client addresses services as `{base}/{service}/...` when an
//! endpoint override is set).

use serde_json::{json, Value};
use sls_dataflow::aws::auth::AwsCredentials;
use sls_dataflow::aws::client::AwsClient;
use sls_dataflow::config::Options;
use sls_dataflow::generator::{generate_edges, generate_nodes, generate_stack_clusters, Relation};
use sls_dataflow::inventory::Inventory;
use sls_dataflow::surveyor::Surveyor;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOPIC: &str = "arn:aws:sns:us-east-1:123456789012:orders-topic";
const QUEUE: &str = "arn:aws:sqs:us-east-1:123456789012:orders-queue";
const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/orders-queue";
const DLQ: &str = "arn:aws:sqs:us-east-1:123456789012:orders-dlq";
const DLQ_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/orders-dlq";
const FUNCTION: &str = "arn:aws:lambda:us-east-1:123456789012:function:orders-fn";
const STACK_ID: &str = "arn:aws:cloudformation:us-east-1:123456789012:stack/orders-stack/abc123";
const BROKEN_STACK_ID: &str =
    "arn:aws:cloudformation:us-east-1:123456789012:stack/broken-stack/def456";

fn ok_json(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

fn test_options(server: &MockServer) -> Options {
    Options {
        region: "us-east-1".to_string(),
        endpoint: Some(server.uri()),
        ..Options::default()
    }
}

fn test_client(server: &MockServer) -> AwsClient {
    AwsClient::with_endpoint(
        "us-east-1",
        &server.uri(),
        AwsCredentials::new("AKIATEST", "test-secret", None),
    )
    .unwrap()
}

async fn survey(server: &MockServer, options: &Options) -> anyhow::Result<Inventory> {
    let client = test_client(server);
    let mut inventory = Inventory::default();
    let surveyor = Surveyor::new(&client, options)?;
    surveyor.survey(&mut inventory).await?;
    Ok(inventory)
}

/// Empty-list responses for every listing endpoint the survey touches.
/// Mount these after the test-specific mocks; wiremock serves the first
/// matching mock in mount order.
async fn mount_empty_defaults(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/apigateway/domainnames"))
        .respond_with(ok_json(json!({ "item": [] })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis"))
        .respond_with(ok_json(json!({ "item": [] })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .respond_with(ok_json(json!({ "QueueUrls": [] })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.ListTopics"))
        .respond_with(ok_json(json!({ "Topics": [] })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.ListSubscriptions"))
        .respond_with(ok_json(json!({ "Subscriptions": [] })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lambda/2015-03-31/functions"))
        .respond_with(ok_json(json!({ "Functions": [] })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lambda/2015-03-31/event-source-mappings"))
        .respond_with(ok_json(json!({ "EventSourceMappings": [] })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/s3/"))
        .respond_with(ok_json(json!({ "Buckets": [] })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cloudformation/"))
        .and(header("x-amz-target", "CloudFormation.ListStacks"))
        .respond_with(ok_json(json!({ "StackSummaries": [] })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn surveys_and_links_the_full_inventory() {
    let server = MockServer::start().await;

    // API Gateway: one domain with two base paths, one API with a Lambda
    // integration and a MOCK integration
    Mock::given(method("GET"))
        .and(path("/apigateway/domainnames"))
        .respond_with(ok_json(json!({ "item": [ { "domainName": "api.example.com" } ] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/domainnames/api.example.com/basepathmappings"))
        .respond_with(ok_json(json!({ "item": [
            { "basePath": "(none)", "restApiId": "api1", "stage": "prod" },
            { "basePath": "v2", "restApiId": "api1", "stage": "prod" }
        ] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis"))
        .respond_with(ok_json(json!({ "item": [ { "id": "api1", "name": "orders-api" } ] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis/api1/resources"))
        .respond_with(ok_json(json!({ "item": [
            { "id": "res1", "path": "/orders", "resourceMethods": { "GET": {}, "POST": {} } }
        ] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis/api1/resources/res1/methods/GET/integration"))
        .respond_with(ok_json(json!({
            "type": "AWS_PROXY",
            "uri": format!("arn:aws:apigateway:us-east-1:lambda:path/2015-03-31/functions/{FUNCTION}/invocations")
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis/api1/resources/res1/methods/POST/integration"))
        .respond_with(ok_json(json!({ "type": "MOCK" })))
        .mount(&server)
        .await;

    // SQS: a queue with a redrive policy pointing at a second queue
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .respond_with(ok_json(json!({ "QueueUrls": [QUEUE_URL, DLQ_URL] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.GetQueueAttributes"))
        .and(body_partial_json(json!({ "QueueUrl": QUEUE_URL })))
        .respond_with(ok_json(json!({ "Attributes": {
            "QueueArn": QUEUE,
            "RedrivePolicy": format!("{{\"deadLetterTargetArn\":\"{DLQ}\",\"maxReceiveCount\":3}}")
        } })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.GetQueueAttributes"))
        .and(body_partial_json(json!({ "QueueUrl": DLQ_URL })))
        .respond_with(ok_json(json!({ "Attributes": { "QueueArn": DLQ } })))
        .mount(&server)
        .await;

    // SNS: one topic, one live subscription and one zombie (404 on detail)
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.ListTopics"))
        .respond_with(ok_json(json!({ "Topics": [ { "TopicArn": TOPIC } ] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.GetTopicAttributes"))
        .respond_with(ok_json(json!({ "Attributes": { "TopicArn": TOPIC, "DisplayName": "orders" } })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.ListSubscriptions"))
        .respond_with(ok_json(json!({ "Subscriptions": [
            {
                "SubscriptionArn": format!("{TOPIC}:11111111"),
                "TopicArn": TOPIC,
                "Endpoint": QUEUE,
                "Protocol": "sqs"
            },
            {
                "SubscriptionArn": format!("{TOPIC}:22222222"),
                "TopicArn": TOPIC,
                "Endpoint": "arn:aws:sqs:us-east-1:123456789012:ghost-queue",
                "Protocol": "sqs"
            }
        ] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.GetSubscriptionAttributes"))
        .and(body_json(json!({ "SubscriptionArn": format!("{TOPIC}:11111111") })))
        .respond_with(ok_json(json!({ "Attributes": { "RawMessageDelivery": "false" } })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sns/"))
        .and(header("x-amz-target", "AmazonSNS.GetSubscriptionAttributes"))
        .and(body_json(json!({ "SubscriptionArn": format!("{TOPIC}:22222222") })))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "__type": "com.amazonaws.sns#NotFoundException",
            "message": "Subscription does not exist"
        })))
        .mount(&server)
        .await;

    // Lambda: one function with a disabled SQS event source and an env var
    // naming the topic
    Mock::given(method("GET"))
        .and(path("/lambda/2015-03-31/functions"))
        .respond_with(ok_json(json!({ "Functions": [ {
            "FunctionArn": FUNCTION,
            "FunctionName": "orders-fn",
            "Environment": { "Variables": { "TOPIC_ARN": TOPIC, "STAGE": "prod" } }
        } ] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lambda/2015-03-31/event-source-mappings"))
        .and(query_param("FunctionName", FUNCTION))
        .respond_with(ok_json(json!({ "EventSourceMappings": [ {
            "UUID": "esm-1",
            "EventSourceArn": QUEUE,
            "State": "Disabled"
        } ] })))
        .mount(&server)
        .await;

    // S3: one bucket notifying all three known resources
    Mock::given(method("GET"))
        .and(path("/s3/"))
        .respond_with(ok_json(json!({ "Buckets": [ { "Name": "orders-bucket" } ] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/s3/orders-bucket"))
        .respond_with(ok_json(json!({
            "LambdaFunctionConfigurations": [ { "LambdaFunctionArn": FUNCTION } ],
            "QueueConfigurations": [ { "QueueArn": QUEUE } ],
            "TopicConfigurations": [ { "TopicArn": TOPIC } ]
        })))
        .mount(&server)
        .await;

    // CloudFormation: one healthy stack, one whose resource listing 400s
    Mock::given(method("POST"))
        .and(path("/cloudformation/"))
        .and(header("x-amz-target", "CloudFormation.ListStacks"))
        .respond_with(ok_json(json!({ "StackSummaries": [
            { "StackName": "orders-stack", "StackId": STACK_ID },
            { "StackName": "broken-stack", "StackId": BROKEN_STACK_ID }
        ] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cloudformation/"))
        .and(header("x-amz-target", "CloudFormation.ListStackResources"))
        .and(body_partial_json(json!({ "StackName": STACK_ID })))
        .respond_with(ok_json(json!({ "StackResourceSummaries": [
            { "ResourceType": "AWS::Lambda::Function", "PhysicalResourceId": "orders-fn" },
            { "ResourceType": "AWS::SQS::Queue", "PhysicalResourceId": QUEUE_URL },
            { "ResourceType": "AWS::IAM::Role", "PhysicalResourceId": "orders-role" }
        ] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cloudformation/"))
        .and(header("x-amz-target", "CloudFormation.ListStackResources"))
        .and(body_partial_json(json!({ "StackName": BROKEN_STACK_ID })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "__type": "ValidationError",
            "message": "Stack with id broken-stack does not exist"
        })))
        .mount(&server)
        .await;

    mount_empty_defaults(&server).await;

    let options = Options {
        cloud_formation: true,
        ..test_options(&server)
    };
    let inventory = survey(&server, &options).await.unwrap();

    // Queues are reachable through both key views, and the subscription
    // recorded on the queue is visible through both.
    assert_eq!(inventory.sqs_queues_by_arn.len(), 2);
    assert_eq!(inventory.sqs_queues_by_url.len(), 2);
    assert_eq!(
        inventory
            .sqs_queues_by_url
            .get(QUEUE_URL)
            .unwrap()
            .borrow()
            .subscriptions
            .len(),
        1
    );

    // The zombie subscription was dropped without aborting the survey.
    assert_eq!(inventory.sns_subscriptions_by_arn.len(), 1);
    let topic = inventory.sns_topics_by_arn.get(TOPIC).unwrap().borrow();
    assert_eq!(topic.subscriptions.len(), 1);
    drop(topic);

    // The event-source mapping resolved to the shared queue record.
    let function = inventory.lambda_functions_by_arn.get(FUNCTION).unwrap();
    assert_eq!(function.event_source_mappings.len(), 1);
    let mapping = &function.event_source_mappings[0];
    assert!(mapping.sqs_queue.is_some());
    assert!(!mapping.is_enabled());

    // The MOCK integration contributed no function link.
    let api = inventory.apig_apis_by_id.get("api1").unwrap();
    assert_eq!(api.lambda_function_arns.len(), 1);
    assert!(api.lambda_function_arns.contains(FUNCTION));

    // Bucket subscribers were all retained (every target is known).
    let bucket = inventory
        .s3_buckets_by_arn
        .get("arn::s3:::orders-bucket")
        .unwrap();
    assert!(bucket.notify_lambda_function_arns.contains(FUNCTION));
    assert!(bucket.notify_sqs_queue_arns.contains(QUEUE));
    assert!(bucket.notify_sns_topic_arns.contains(TOPIC));

    // The broken stack degraded to zero resources instead of failing.
    assert_eq!(
        inventory
            .cf_stacks_by_name
            .get("orders-stack")
            .unwrap()
            .resources
            .len(),
        3
    );
    assert!(inventory
        .cf_stacks_by_name
        .get("broken-stack")
        .unwrap()
        .resources
        .is_empty());

    // Graph derivation over the surveyed inventory.
    let mut nodes = generate_nodes(&inventory);
    let edges = generate_edges(&inventory);
    let clusters = generate_stack_clusters(&inventory, &mut nodes);

    let subscriber = edges.get(&format!("{QUEUE}->{TOPIC}")).unwrap();
    assert_eq!(subscriber.relation, Relation::Subscriber);

    let consumer = edges.get(&format!("{FUNCTION}->{QUEUE}")).unwrap();
    assert_eq!(consumer.relation, Relation::Consumer);
    assert_eq!(consumer.state_is_enabled, Some(false));
    assert_eq!(consumer.dashes, Some(true));

    let user = edges.get(&format!("{FUNCTION}->{TOPIC}")).unwrap();
    assert_eq!(user.relation, Relation::User);

    let dlq = edges.get(&format!("{DLQ}->{QUEUE}")).unwrap();
    assert_eq!(dlq.relation, Relation::DLQ);

    assert!(edges.contains_key("api.example.com/"));
    assert!(edges.contains_key(&format!("api.example.com/v2->{FUNCTION}")));
    assert!(edges.contains_key(&format!("{TOPIC}->arn::s3:::orders-bucket")));

    assert_eq!(clusters.len(), 1);
    assert_eq!(nodes.get(FUNCTION).unwrap().stack_name.as_deref(), Some("orders-stack"));
    assert_eq!(nodes.get(QUEUE).unwrap().stack_id.as_deref(), Some(STACK_ID));
    assert!(!clusters.contains_key(BROKEN_STACK_ID));
}

#[tokio::test]
async fn paginates_across_all_cursor_styles() {
    let server = MockServer::start().await;

    // SQS pages by NextToken
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .and(body_json(json!({})))
        .respond_with(ok_json(json!({ "QueueUrls": [QUEUE_URL], "NextToken": "t1" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .and(body_json(json!({ "NextToken": "t1" })))
        .respond_with(ok_json(json!({ "QueueUrls": [DLQ_URL] })))
        .mount(&server)
        .await;
    for (url, arn) in [(QUEUE_URL, QUEUE), (DLQ_URL, DLQ)] {
        Mock::given(method("POST"))
            .and(path("/sqs/"))
            .and(header("x-amz-target", "AmazonSQS.GetQueueAttributes"))
            .and(body_partial_json(json!({ "QueueUrl": url })))
            .respond_with(ok_json(json!({ "Attributes": { "QueueArn": arn } })))
            .mount(&server)
            .await;
    }

    // Lambda pages by Marker/NextMarker
    let second_fn = "arn:aws:lambda:us-east-1:123456789012:function:audit-fn";
    Mock::given(method("GET"))
        .and(path("/lambda/2015-03-31/functions"))
        .and(query_param_is_missing("Marker"))
        .respond_with(ok_json(json!({
            "Functions": [ { "FunctionArn": FUNCTION, "FunctionName": "orders-fn" } ],
            "NextMarker": "m1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/lambda/2015-03-31/functions"))
        .and(query_param("Marker", "m1"))
        .respond_with(ok_json(json!({
            "Functions": [ { "FunctionArn": second_fn, "FunctionName": "audit-fn" } ]
        })))
        .mount(&server)
        .await;

    // API Gateway pages by position
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis"))
        .and(query_param_is_missing("position"))
        .respond_with(ok_json(json!({ "item": [ { "id": "api1", "name": "a" } ], "position": "p1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apigateway/restapis"))
        .and(query_param("position", "p1"))
        .respond_with(ok_json(json!({ "item": [ { "id": "api2", "name": "b" } ] })))
        .mount(&server)
        .await;
    for api in ["api1", "api2"] {
        Mock::given(method("GET"))
            .and(path(format!("/apigateway/restapis/{api}/resources")))
            .respond_with(ok_json(json!({ "item": [] })))
            .mount(&server)
            .await;
    }

    mount_empty_defaults(&server).await;

    let options = test_options(&server);
    let inventory = survey(&server, &options).await.unwrap();

    assert_eq!(inventory.sqs_queues_by_arn.len(), 2);
    assert_eq!(inventory.lambda_functions_by_arn.len(), 2);
    assert_eq!(inventory.apig_apis_by_id.len(), 2);
}

#[tokio::test]
async fn retries_throttled_calls_and_recovers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "__type": "ThrottlingException",
            "message": "Rate exceeded"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .respond_with(ok_json(json!({ "QueueUrls": [QUEUE_URL] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.GetQueueAttributes"))
        .respond_with(ok_json(json!({ "Attributes": { "QueueArn": QUEUE } })))
        .mount(&server)
        .await;

    mount_empty_defaults(&server).await;

    let options = test_options(&server);
    let inventory = survey(&server, &options).await.unwrap();
    assert_eq!(inventory.sqs_queues_by_arn.len(), 1);
}

#[tokio::test]
async fn include_exclude_filters_apply_at_first_insertion() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/sqs/"))
        .and(header("x-amz-target", "AmazonSQS.ListQueues"))
        .respond_with(ok_json(json!({ "QueueUrls": [QUEUE_URL, DLQ_URL] })))
        .mount(&server)
        .await;
    for (url, arn) in [(QUEUE_URL, QUEUE), (DLQ_URL, DLQ)] {
        Mock::given(method("POST"))
            .and(path("/sqs/"))
            .and(header("x-amz-target", "AmazonSQS.GetQueueAttributes"))
            .and(body_partial_json(json!({ "QueueUrl": url })))
            .respond_with(ok_json(json!({ "Attributes": { "QueueArn": arn } })))
            .mount(&server)
            .await;
    }

    mount_empty_defaults(&server).await;

    let options = Options {
        include: vec!["*orders*".to_string()],
        exclude: vec!["*dlq*".to_string()],
        ..test_options(&server)
    };
    let inventory = survey(&server, &options).await.unwrap();

    // The DLQ was excluded at insertion, so it is invisible even though the
    // surviving queue could reference it.
    assert_eq!(inventory.sqs_queues_by_arn.len(), 1);
    assert!(inventory.sqs_queues_by_arn.contains_key(QUEUE));
    assert!(!inventory.sqs_queues_by_arn.contains_key(DLQ));
}
