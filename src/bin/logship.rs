use anyhow::{anyhow, Context, Result};
use clap::{value_t, App, Arg, ArgMatches, SubCommand};
use slog::{error, info, o, Logger};
use std::{
    env, fs,
    io::Read,
    str::FromStr,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use uuid::Uuid;

use logship::{
    cancel::CancellationToken,
    config::Config,
    export::HttpExporter,
    flowlog::{DescribeFlowLogsFormatSource, FlowLogFormatSource, FormatCache},
    ingest::decode_logs_payload,
    logging::{event, setup_logging, LoggingConfiguration},
    metrics::{
        start_metrics_scrape_endpoint, ApiClientMetricsCollector, ExportMetricsCollector,
        PipelineMetricsCollector,
    },
    pipeline::{InvocationSummary, Pipeline},
    secrets::{resolve_secrets, KmsSecretDecrypter, SecretDecrypter},
    task::{AwsSqsTaskQueue, DeliveryTask, TaskQueue},
};

fn num_validator<F: FromStr>(s: String) -> Result<(), String> {
    s.parse::<F>()
        .map(|_| ())
        .map_err(|_| "could not parse value as number".to_owned())
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("logship")
        .about(
            "Forwards cloud log deliveries to an OpenTelemetry ingest \
            endpoint. Classifies audit, container insights, Fargate and VPC \
            flow log records, enriches them with host and Kubernetes \
            identity, and ships OTLP payloads under at-least-once semantics. \
            The endpoint and API token are read from OTLP_ENDPOINT and \
            API_TOKEN (or SWI_OTEL_ENDPOINT / SWI_API_KEY).",
        )
        .arg(
            Arg::with_name("force-json-log-output")
                .long("force-json-log-output")
                .env("FORCE_JSON_LOG_OUTPUT")
                .value_name("BOOL")
                .possible_value("true")
                .possible_value("false")
                .default_value("false")
                .help("Force log output to JSON format"),
        )
        .subcommand(
            SubCommand::with_name("process-event")
                .about("Process a single trigger event and exit")
                .arg(
                    Arg::with_name("event-file")
                        .long("event-file")
                        .value_name("PATH")
                        .help("Path to a trigger event JSON document (\"-\" for stdin)"),
                )
                .arg(
                    Arg::with_name("staged-file")
                        .long("staged-file")
                        .value_name("PATH")
                        .help(
                            "Path to a staged newline-delimited JSON object \
                            already fetched from the object store",
                        ),
                )
                .arg(
                    Arg::with_name("source-object")
                        .long("source-object")
                        .value_name("NAME")
                        .help("Object name recorded on records read from --staged-file"),
                ),
        )
        .subcommand(
            SubCommand::with_name("worker")
                .about("Pull trigger events from a task queue until terminated")
                .arg(
                    Arg::with_name("task-queue-url")
                        .long("task-queue-url")
                        .env("TASK_QUEUE_URL")
                        .value_name("URL")
                        .required(true)
                        .help("URL of the SQS queue delivering trigger events"),
                )
                .arg(
                    Arg::with_name("task-queue-region")
                        .long("task-queue-region")
                        .env("TASK_QUEUE_REGION")
                        .value_name("REGION")
                        .help("AWS region of the task queue (defaults to AWS_REGION)"),
                )
                .arg(
                    Arg::with_name("metrics-scrape-port")
                        .long("metrics-scrape-port")
                        .env("METRICS_SCRAPE_PORT")
                        .value_name("PORT")
                        .validator(num_validator::<u16>)
                        .default_value("8080")
                        .help("TCP port for the Prometheus metrics scrape endpoint"),
                ),
        )
}

fn main() -> Result<(), anyhow::Error> {
    let matches = app().get_matches();

    let force_json_log_output = value_t!(matches.value_of("force-json-log-output"), bool)?;
    let log_level = &env::var("RUST_LOG")
        .unwrap_or_else(|_| "INFO".to_owned())
        .to_uppercase();
    let (root_logger, _guard) = setup_logging(&LoggingConfiguration {
        force_json_output: force_json_log_output,
        version_string: option_env!("BUILD_INFO").unwrap_or("(BUILD_INFO unavailable)"),
        log_level,
    })?;

    if let Err(error) = run(matches, root_logger) {
        // Startup failures are the only fatal outcome; per-delivery
        // failures are reported to the caller in-band. The error is printed
        // here, while the logger guard is still alive.
        eprintln!("Error: {:?}", error);
        std::process::exit(1);
    }

    Ok(())
}

struct Forwarder {
    pipeline: Pipeline,
    config: Config,
    format_cache: FormatCache,
    format_source: Option<Box<dyn FlowLogFormatSource>>,
    logger: Logger,
}

fn run(matches: ArgMatches, root_logger: Logger) -> Result<()> {
    let config = Config::from_env().context("configuration is incomplete")?;

    let decrypter: Option<KmsSecretDecrypter> = if config.use_encryption
        && config.managed_environment
    {
        Some(KmsSecretDecrypter::new().context("failed to construct KMS decrypter")?)
    } else {
        None
    };
    let secrets = resolve_secrets(
        &config,
        decrypter.as_ref().map(|d| d as &dyn SecretDecrypter),
        &root_logger,
    )
    .context("failed to resolve endpoint and token")?;
    info!(
        root_logger, "resolved outbound endpoint";
        event::ENDPOINT => secrets.endpoint.as_str(),
    );

    let api_metrics = ApiClientMetricsCollector::new()?;
    let pipeline_metrics = PipelineMetricsCollector::new()?;
    let export_metrics = ExportMetricsCollector::new()?;

    // SIGTERM and SIGINT request a graceful stop; the drivers notice at the
    // next record boundary and workers before their next export.
    let stop_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop_flag))
        .context("failed to register SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop_flag))
        .context("failed to register SIGINT handler")?;
    let cancel = CancellationToken::with_flag(stop_flag);

    let exporter = HttpExporter::new(&secrets, &api_metrics);
    let pipeline = Pipeline::new(
        Box::new(exporter),
        config.region_fallback.clone(),
        cancel.clone(),
        pipeline_metrics,
        export_metrics,
        &root_logger,
    );

    // The provider API client is only needed when a flow log group is
    // configured; failing to construct it then is a startup failure.
    let format_source: Option<Box<dyn FlowLogFormatSource>> = match &config.vpc_log_group {
        Some(_) => Some(Box::new(
            DescribeFlowLogsFormatSource::new(&root_logger)
                .context("failed to construct flow log format client")?,
        )),
        None => None,
    };

    let forwarder = Forwarder {
        pipeline,
        format_cache: FormatCache::new(config.flow_log_cache_ttl),
        format_source,
        config,
        logger: root_logger,
    };

    match matches.subcommand() {
        ("process-event", Some(sub_matches)) => process_event(&forwarder, sub_matches),
        ("worker", Some(sub_matches)) => worker(&forwarder, sub_matches, &cancel),
        (_, _) => Err(anyhow!("a subcommand is required (process-event, worker)")),
    }
}

fn process_event(forwarder: &Forwarder, sub_matches: &ArgMatches) -> Result<()> {
    if let Some(path) = sub_matches.value_of("staged-file") {
        let object_name = sub_matches.value_of("source-object").unwrap_or(path);
        let file = fs::File::open(path).context("failed to open staged file")?;
        forwarder.pipeline.run_staged_object(file, object_name);
        return Ok(());
    }

    let event_path = sub_matches
        .value_of("event-file")
        .ok_or_else(|| anyhow!("one of --event-file or --staged-file is required"))?;
    let raw = if event_path == "-" {
        let mut buffer = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buffer)
            .context("failed to read event from stdin")?;
        buffer
    } else {
        fs::read(event_path).context("failed to read event file")?
    };

    let envelope: serde_json::Value =
        serde_json::from_slice(&raw).context("trigger event is not valid JSON")?;
    let data = envelope
        .pointer("/awslogs/data")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow!("trigger event carries no awslogs payload"))?;

    process_logs_payload(forwarder, data)?;
    Ok(())
}

/// Decodes a logs payload and routes the delivery to the logs or flow log
/// pipeline based on its log group.
fn process_logs_payload(forwarder: &Forwarder, data: &str) -> Result<InvocationSummary> {
    let delivery = decode_logs_payload(data)?;

    let summary = if forwarder.config.is_flow_log_group(&delivery.log_group) {
        let source = forwarder
            .format_source
            .as_ref()
            .ok_or_else(|| anyhow!("flow log delivery but no provider API client"))?;
        forwarder.pipeline.run_flow_log_delivery(
            &delivery,
            &forwarder.format_cache,
            source.as_ref(),
            forwarder.config.debug_interval,
            forwarder.config.verbose,
        )
    } else {
        forwarder.pipeline.run_logs_delivery(&delivery)
    };
    Ok(summary)
}

fn worker(forwarder: &Forwarder, sub_matches: &ArgMatches, cancel: &CancellationToken) -> Result<()> {
    let scrape_port = value_t!(sub_matches.value_of("metrics-scrape-port"), u16)?;
    // The runtime keeps the scrape endpoint alive for the worker's lifetime.
    let _metrics_runtime = start_metrics_scrape_endpoint(scrape_port)?;

    let queue_region = sub_matches
        .value_of("task-queue-region")
        .map(str::to_owned)
        .or_else(|| env::var("AWS_REGION").ok())
        .ok_or_else(|| anyhow!("no region for task queue (set --task-queue-region)"))?;
    let queue_url = sub_matches.value_of("task-queue-url").unwrap();
    let queue: AwsSqsTaskQueue<DeliveryTask> =
        AwsSqsTaskQueue::new(&queue_region, queue_url, &forwarder.logger)?;

    info!(forwarder.logger, "worker started");
    while !cancel.is_cancelled() {
        let handle = match queue.dequeue() {
            Ok(Some(handle)) => handle,
            Ok(None) => continue,
            Err(error) => {
                error!(forwarder.logger, "failed to dequeue task: {:?}", error);
                std::thread::sleep(Duration::from_secs(5));
                continue;
            }
        };

        let trace_id = handle.task.trace_id.unwrap_or_else(Uuid::new_v4);
        let logger = forwarder
            .logger
            .new(o!(event::TRACE_ID => trace_id.to_string()));

        match handle_delivery(forwarder, &handle.task) {
            Ok(summary) if summary.success => {
                queue.acknowledge_task(handle)?;
            }
            Ok(summary) => {
                // Some or all batches failed in transit; redeliver so the
                // remote end sees every record at least once.
                error!(
                    logger, "delivery failed, returning task to the queue";
                    "last_error" => summary.last_error.unwrap_or_default(),
                );
                queue.nacknowledge_task(handle)?;
            }
            Err(error) => {
                // Undecodable deliveries can never succeed; drop them
                // rather than poisoning the queue.
                error!(logger, "discarding undecodable delivery: {:?}", error);
                queue.acknowledge_task(handle)?;
            }
        }
    }

    info!(forwarder.logger, "worker stopping");
    Ok(())
}

fn handle_delivery(forwarder: &Forwarder, task: &DeliveryTask) -> Result<InvocationSummary> {
    if let Some(data) = &task.awslogs_data {
        return process_logs_payload(forwarder, data);
    }
    // Staged objects name a bucket and key; fetching the object is the
    // staging collaborator's job, so a worker deployment without one cannot
    // process these tasks.
    Err(anyhow!(
        "staged-object tasks require the staging collaborator: {}",
        task
    ))
}
