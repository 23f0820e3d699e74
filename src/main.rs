use anyhow::{Context, Result};
use clap::Parser;
use sls_dataflow::aws::auth::AwsCredentials;
use sls_dataflow::aws::client::AwsClient;
use sls_dataflow::aws::http::{as_api_error, user_facing_error};
use sls_dataflow::config::Options;
use sls_dataflow::generator::Generator;
use sls_dataflow::inventory::Inventory;
use sls_dataflow::surveyor::Surveyor;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Parallelism is decremented on systemic throttling until this floor;
/// below it the run gives up.
const MIN_PARALLELISM: u32 = 1;

/// Cool-down before restarting a throttled survey.
const THROTTLE_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Visualise AWS serverless dataflow
#[derive(Parser, Debug)]
#[command(name = "sls-dataflow", version, about, long_about = "\
Surveys the serverless resources (Lambda, API Gateway, SNS, SQS, S3, and \
optionally CloudFormation stacks) of an AWS account and generates node/edge \
graph data describing how they are connected.

Log into your AWS account (through command line tools like aws, saml2aws, \
okta-aws) before running this tool.")]
struct Args {
    /// AWS region (required unless AWS_REGION or AWS_DEFAULT_REGION is set)
    #[arg(short, long)]
    region: Option<String>,

    /// Wildcard patterns for domain names and ARNs of Lambda functions/SNS
    /// topics/SQS queues that should be included
    #[arg(short, long, default_value = "*")]
    include: Vec<String>,

    /// Wildcard patterns for domain names and ARNs of Lambda functions/SNS
    /// topics/SQS queues that should be excluded
    #[arg(short = 'x', long)]
    exclude: Vec<String>,

    /// Survey CloudFormation stack information (this takes more time)
    #[arg(short, long)]
    cloud_formation: bool,

    /// Approximately how many AWS API calls are allowed at the same time
    #[arg(short = 'l', long, default_value_t = 4)]
    parallelism: u32,

    /// No console output
    #[arg(short, long)]
    quiet: bool,

    /// Output debug messages
    #[arg(short, long)]
    debug: bool,

    /// Custom base endpoint, e.g. a LocalStack URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Path for putting generated graph data files
    #[arg(default_value = "dataflow")]
    path: String,
}

fn setup_logging(quiet: bool, debug: bool) {
    let default_level = if quiet {
        "error"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sls_dataflow={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

/// The top-level survey state machine: systemic throttling restarts the
/// whole survey with one less parallelism until the floor is reached.
enum RunState {
    Surveying(u32),
    Done,
    Failed(anyhow::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.quiet, args.debug);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {}", user_facing_error(&error));
            eprintln!("  {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let region = args
        .region
        .clone()
        .or_else(|| std::env::var("AWS_REGION").ok())
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .context("No AWS region configured. Use --region or set the AWS_REGION environment variable")?;

    let options = Options {
        region,
        include: args.include,
        exclude: args.exclude,
        cloud_formation: args.cloud_formation,
        parallelism: args.parallelism.max(MIN_PARALLELISM),
        quiet: args.quiet,
        debug: args.debug,
        output_path: args.path,
        endpoint: args.endpoint,
        command_line: reconstructed_command_line(),
    };
    tracing::debug!("Command line: {}", options.command_line);

    let mut state = RunState::Surveying(options.parallelism);
    loop {
        state = match state {
            RunState::Surveying(parallelism) => {
                let attempt = options.with_parallelism(parallelism);
                match do_run(&attempt).await {
                    Ok(()) => RunState::Done,
                    Err(error) => next_state_after(error, parallelism).await,
                }
            }
            RunState::Done => return Ok(()),
            RunState::Failed(error) => return Err(error),
        };
    }
}

/// Decides whether a failed survey is restarted with reduced parallelism.
async fn next_state_after(error: anyhow::Error, parallelism: u32) -> RunState {
    let api = as_api_error(&error);

    if api.is_some_and(|e| e.is_expired_credentials()) {
        tracing::error!("Did you forget to log into AWS? Please log into your AWS account and try again.");
        return RunState::Failed(error);
    }

    if api.is_some_and(|e| e.is_throttling()) {
        if parallelism > MIN_PARALLELISM {
            tracing::info!(
                "AWS is not able to handle too many requests at the same time. \
                 Restarting with parallelism changing from {} to {} ...",
                parallelism,
                parallelism - 1
            );
            tracing::info!("(Parallelism can be specified by -l / --parallelism option)");
            tokio::time::sleep(THROTTLE_RESTART_DELAY).await;
            return RunState::Surveying(parallelism - 1);
        }
        return RunState::Failed(error.context(format!(
            "AWS is not able to handle too many requests at the same time, \
             even with parallelism {MIN_PARALLELISM}. Please try later."
        )));
    }

    RunState::Failed(error)
}

/// One complete survey + generation attempt. Nothing is written unless the
/// whole survey succeeds.
async fn do_run(options: &Options) -> Result<()> {
    let client = match &options.endpoint {
        Some(endpoint) => {
            AwsClient::with_endpoint(&options.region, endpoint, AwsCredentials::resolve()?)?
        }
        None => AwsClient::new(&options.region)?,
    };

    let mut inventory = Inventory::default();
    let surveyor = Surveyor::new(&client, options)?;
    surveyor.survey(&mut inventory).await?;

    Generator::new(options).generate(&inventory)
}

fn reconstructed_command_line() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}
