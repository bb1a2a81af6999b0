use crate::{
    cancel::CancellationToken,
    classify::{classify, AppLogEvent, ClassifiedEvent},
    export::Exporter,
    flowlog::{
        build_flow_metrics, FlowLogFormat, FlowLogFormatSource, FlowLogParser, FormatCache,
        FormatLookup, DEFAULT_FORMAT,
    },
    ingest::{ndjson_lines, LogsDelivery},
    logging::event,
    metrics::{ExportMetricsCollector, PipelineMetricsCollector},
    otlp::{AnyValue, ContainerIdentity, KeyValue, LogsData, ResourceLogs, ScopeLogs},
    staged::{attribute_record, ServiceBatcher},
    work_queue::WorkQueue,
    MAX_RECORDS_PER_REQUEST,
};
use anyhow::{Context, Result};
use slog::{debug, info, o, warn, Logger};
use std::{io::Read, thread};

/// Per-record attribute naming the Kubernetes log stream type of a pod
/// application log.
const K8S_LOG_TYPE_KEY: &str = "sw.k8s.log.type";

/// Upper bound on concurrently running export workers within one delivery.
const MAX_EXPORT_WORKERS: usize = 4;

/// What happened to one delivery. Success requires every launched export to
/// have succeeded; record-level parse and validation failures only drop the
/// record in question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSummary {
    pub success: bool,
    pub exported_batches: usize,
    pub processed_records: u64,
    pub dropped_records: u64,
    pub last_error: Option<String>,
}

impl InvocationSummary {
    fn status(&self) -> &'static str {
        if self.success {
            "success"
        } else {
            "failure"
        }
    }
}

/// The per-delivery driver. One instance is built at startup and reused for
/// every delivery; it owns no per-delivery state.
pub struct Pipeline {
    exporter: Box<dyn Exporter>,
    pipeline_metrics: PipelineMetricsCollector,
    export_metrics: ExportMetricsCollector,
    cancel: CancellationToken,
    region_fallback: Option<String>,
    logger: Logger,
}

impl Pipeline {
    pub fn new(
        exporter: Box<dyn Exporter>,
        region_fallback: Option<String>,
        cancel: CancellationToken,
        pipeline_metrics: PipelineMetricsCollector,
        export_metrics: ExportMetricsCollector,
        parent_logger: &Logger,
    ) -> Pipeline {
        Pipeline {
            exporter,
            pipeline_metrics,
            export_metrics,
            cancel,
            region_fallback,
            logger: parent_logger.new(o!()),
        }
    }

    /// Processes a logs-stream delivery: classify and enrich every event,
    /// group records under host and container identities, and ship the
    /// resulting payloads. Stream records carry no service metadata, so the
    /// resource identity is the partition key here; per-service
    /// partitioning happens on the staged path, whose records do.
    pub fn run_logs_delivery(&self, delivery: &LogsDelivery) -> InvocationSummary {
        let logger = self.logger.new(o!(
            event::CLOUD_ACCOUNT => delivery.owner.clone(),
            event::LOG_GROUP => delivery.log_group.clone(),
            event::LOG_STREAM => delivery.log_stream.clone(),
        ));
        info!(logger, "processing logs delivery"; "events" => delivery.log_events.len());

        let mut payloads: Vec<LogsData> = Vec::new();
        let mut builder = self.new_builder(delivery);
        let mut processed = 0u64;

        for log_event in &delivery.log_events {
            processed += 1;
            let classified = classify(&log_event.message);
            self.pipeline_metrics
                .records_processed
                .with_label_values(&[kind_label(&classified)])
                .inc();

            match &classified {
                ClassifiedEvent::AppLog(app) if app.is_fargate() => {
                    self.handle_fargate_record(
                        app,
                        &classified,
                        log_event.timestamp_nanos(),
                        delivery,
                        &mut builder,
                        &mut payloads,
                    );
                }
                ClassifiedEvent::Unknown => {
                    // A generic message must not be attributed to a host the
                    // stream name contradicts.
                    let stream_conflict = match builder.stream_instance_id() {
                        Some(stream_instance) => {
                            builder.has_host_id() && !builder.match_host_id(stream_instance)
                        }
                        None => false,
                    };
                    if stream_conflict && builder.record_count() > 0 {
                        payloads.push(builder.build());
                        builder = self.new_builder(delivery);
                    }
                    let region = self.effective_region(&classified, &builder);
                    builder.add_log_entry(
                        log_event.timestamp_nanos(),
                        AnyValue::StringValue(log_event.message.clone()),
                        &region,
                        vec![],
                    );
                }
                _ => {
                    if let Some(instance_id) = classified.host_identity() {
                        if !builder.has_host_id() {
                            builder.set_host_id(instance_id);
                        } else if !builder.match_host_id(instance_id) {
                            debug!(
                                logger, "host identity changed, closing batch";
                                event::HOST_ID => instance_id,
                            );
                            payloads.push(builder.build());
                            builder = self.new_builder(delivery);
                            builder.set_host_id(instance_id);
                        }
                    }
                    let region = self.effective_region(&classified, &builder);
                    builder.add_log_entry(
                        log_event.timestamp_nanos(),
                        AnyValue::StringValue(log_event.message.clone()),
                        &region,
                        vec![],
                    );
                }
            }
        }

        if builder.record_count() > 0 {
            payloads.push(builder.build());
        }

        let summary = self.export_log_payloads(payloads, processed, 0, &logger);
        self.finish(&summary, &logger);
        summary
    }

    fn handle_fargate_record(
        &self,
        app: &AppLogEvent,
        classified: &ClassifiedEvent,
        timestamp_nanos: u64,
        delivery: &LogsDelivery,
        builder: &mut crate::otlp::LogsRequestBuilder,
        payloads: &mut Vec<LogsData>,
    ) {
        let identity = ContainerIdentity {
            cluster_uid: app.cluster_uid.clone(),
            namespace: app.kubernetes.namespace_name.clone(),
            pod_name: app.kubernetes.pod_name.clone(),
            container_name: app.kubernetes.container_name.clone(),
        };

        if !builder.has_container_identity() {
            populate_kubernetes_attributes(builder, app, identity);
        } else if !builder.match_container_identity(&identity) {
            payloads.push(std::mem::replace(builder, self.new_builder(delivery)).build());
            populate_kubernetes_attributes(builder, app, identity);
        }

        let region = self.effective_region(classified, builder);
        builder.add_log_entry(
            timestamp_nanos,
            AnyValue::StringValue(app.log.clone()),
            &region,
            vec![KeyValue::string(K8S_LOG_TYPE_KEY, &app.log_type)],
        );
    }

    /// Processes a staged newline-delimited JSON object: attribute every
    /// record to a service, accumulate per-service sub-batches, and ship
    /// them.
    pub fn run_staged_object<R: Read>(&self, reader: R, object_name: &str) -> InvocationSummary {
        let logger = self.logger.new(o!(
            event::SOURCE_OBJECT => object_name.to_owned(),
        ));
        info!(logger, "processing staged object");

        let mut batcher = ServiceBatcher::new();
        let mut payloads = Vec::new();
        let mut processed = 0u64;
        let mut dropped = 0u64;

        for line in ndjson_lines(reader) {
            if self.cancel.is_cancelled() {
                info!(logger, "cancelled, stopping staged object early");
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    warn!(logger, "read error on staged object: {}", error);
                    break;
                }
            };
            processed += 1;

            let record: serde_json::Value = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(error) => {
                    dropped += 1;
                    self.pipeline_metrics
                        .records_dropped
                        .with_label_values(&["parse"])
                        .inc();
                    debug!(logger, "dropping unparseable staged record: {}", error);
                    continue;
                }
            };

            let (service, log_record) = attribute_record(&record, object_name);
            if let Some(full) = batcher.push(service, log_record) {
                payloads.push(full);
            }
        }

        payloads.extend(batcher.drain());

        let summary = self.export_log_payloads(payloads, processed, dropped, &logger);
        self.finish(&summary, &logger);
        summary
    }

    /// Processes a flow log delivery: resolve the log group's format, parse
    /// and validate every record, and ship one metrics envelope per valid
    /// record.
    pub fn run_flow_log_delivery(
        &self,
        delivery: &LogsDelivery,
        cache: &FormatCache,
        source: &dyn FlowLogFormatSource,
        debug_interval: u64,
        verbose: bool,
    ) -> InvocationSummary {
        let logger = self.logger.new(o!(
            event::LOG_GROUP => delivery.log_group.clone(),
            event::LOG_STREAM => delivery.log_stream.clone(),
        ));

        let lookup = match self.resolve_format(delivery, cache, source, &logger) {
            Ok(lookup) => lookup,
            Err(error) => {
                let summary = InvocationSummary {
                    success: false,
                    exported_batches: 0,
                    processed_records: 0,
                    dropped_records: 0,
                    last_error: Some(format!("{error:#}")),
                };
                self.finish(&summary, &logger);
                return summary;
            }
        };

        let custom_format = if lookup.format.is_empty() || lookup.format == DEFAULT_FORMAT {
            None
        } else {
            match FlowLogFormat::parse(&lookup.format) {
                Ok(format) => Some(format),
                Err(error) => {
                    let summary = InvocationSummary {
                        success: false,
                        exported_batches: 0,
                        processed_records: 0,
                        dropped_records: 0,
                        last_error: Some(format!(
                            "unusable flow log format {:?}: {error}",
                            lookup.format
                        )),
                    };
                    self.finish(&summary, &logger);
                    return summary;
                }
            }
        };
        if verbose {
            debug!(
                logger, "resolved flow log format";
                event::FLOW_LOG_FORMAT => &lookup.format,
                "flow_log_id" => &lookup.flow_log_id,
                "flow_log_count" => lookup.flow_log_count,
                "custom" => custom_format.is_some(),
            );
        }

        let parser = FlowLogParser::new(&logger);
        let mut processed = 0u64;
        let mut dropped = 0u64;
        let mut exported = 0usize;
        let mut last_error = None;

        for log_event in &delivery.log_events {
            // Flow log batches can be large; honor the ambient deadline at
            // record granularity.
            if self.cancel.is_cancelled() {
                info!(logger, "cancelled, stopping flow log delivery early");
                break;
            }
            processed += 1;

            let parsed = match &custom_format {
                Some(format) => parser.parse_custom(&log_event.message, format),
                None => parser.parse_default(&log_event.message),
            };
            let record = match parsed {
                Ok(record) => record,
                Err(error) => {
                    dropped += 1;
                    self.pipeline_metrics
                        .records_dropped
                        .with_label_values(&["flow_log"])
                        .inc();
                    if verbose {
                        debug!(logger, "dropping flow log record: {}", error);
                    }
                    continue;
                }
            };

            let payload = build_flow_metrics(&record);
            if processed % debug_interval.max(1) == 0 {
                match serde_json::to_string(&payload) {
                    Ok(rendered) => debug!(logger, "flow metrics payload: {}", rendered),
                    Err(error) => debug!(logger, "payload did not render: {}", error),
                }
            }

            match self.exporter.export_metrics(&payload, &logger) {
                Ok(()) => {
                    exported += 1;
                    self.export_metrics
                        .batches_exported
                        .with_label_values(&["metrics", "success"])
                        .inc();
                }
                Err(error) => {
                    self.export_metrics
                        .batches_exported
                        .with_label_values(&["metrics", "error"])
                        .inc();
                    warn!(logger, "failed to export flow metrics: {}", error);
                    last_error = Some(error.to_string());
                }
            }
        }

        let summary = InvocationSummary {
            success: last_error.is_none(),
            exported_batches: exported,
            processed_records: processed,
            dropped_records: dropped,
            last_error,
        };
        self.finish(&summary, &logger);
        summary
    }

    fn resolve_format(
        &self,
        delivery: &LogsDelivery,
        cache: &FormatCache,
        source: &dyn FlowLogFormatSource,
        logger: &Logger,
    ) -> Result<FormatLookup> {
        if let Some(cached) = cache.get(&delivery.log_group) {
            debug!(logger, "flow log format cache hit");
            return Ok(FormatLookup {
                format: cached.format,
                flow_log_id: cached.flow_log_id,
                flow_log_count: cached.flow_log_count,
            });
        }

        let lookup = source
            .lookup(&delivery.log_group)
            .context("failed to retrieve flow log format")?;
        cache.set(
            &delivery.log_group,
            &lookup.format,
            &lookup.flow_log_id,
            lookup.flow_log_count,
        );
        Ok(lookup)
    }

    fn new_builder(&self, delivery: &LogsDelivery) -> crate::otlp::LogsRequestBuilder {
        let mut builder = crate::otlp::LogsRequestBuilder::new();
        builder
            .set_cloud_account(&delivery.owner)
            .set_log_group(&delivery.log_group)
            .set_log_stream(&delivery.log_stream);
        builder
    }

    /// The region to attach to a record: what the record itself carries,
    /// else what the stream name implied (applied inside the builder), else
    /// the environment fallback.
    fn effective_region(
        &self,
        classified: &ClassifiedEvent,
        builder: &crate::otlp::LogsRequestBuilder,
    ) -> String {
        if let Some(region) = classified.region() {
            return region.to_owned();
        }
        if builder.stream_region().is_some() {
            // Leave it empty; the builder fills in the stream region.
            return String::new();
        }
        self.region_fallback.clone().unwrap_or_default()
    }

    /// Ships a set of logs payloads with bounded fan-out, splitting any
    /// payload that exceeds the per-request record cap. Each payload is one
    /// partition (a resource identity, or a service on the staged path);
    /// worker count never exceeds the partitions in flight.
    fn export_log_payloads(
        &self,
        payloads: Vec<LogsData>,
        processed: u64,
        dropped: u64,
        logger: &Logger,
    ) -> InvocationSummary {
        let jobs: Vec<LogsData> = payloads.into_iter().flat_map(split_payload).collect();
        let job_count = jobs.len();

        let work_queue: WorkQueue<LogsData, Result<(), String>> = WorkQueue::new(jobs);
        let worker_count = job_count.min(MAX_EXPORT_WORKERS);
        let mut workers = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let mut queue = work_queue.clone();
            let exporter = self.exporter.clone();
            let export_metrics = self.export_metrics.clone();
            let cancel = self.cancel.clone();
            let logger = logger.clone();
            workers.push(thread::spawn(move || {
                while let Some(payload) = queue.dequeue_job() {
                    if cancel.is_cancelled() {
                        queue.send_results(Err("export cancelled".to_owned()));
                        continue;
                    }
                    let result = exporter.export_logs(&payload, &logger);
                    let status = if result.is_ok() { "success" } else { "error" };
                    export_metrics
                        .batches_exported
                        .with_label_values(&["logs", status])
                        .inc();
                    queue.send_results(result.map_err(|e| e.to_string()));
                }
            }));
        }

        for worker in workers {
            // A panicking worker is a bug; surface it instead of reporting a
            // bogus partial success.
            worker.join().expect("export worker panicked");
        }

        let results = work_queue
            .results()
            .expect("all export workers have finished");
        let exported = results.iter().filter(|r| r.is_ok()).count();
        let last_error = results
            .into_iter()
            .filter_map(|result| result.err())
            .last();
        if let Some(error) = &last_error {
            warn!(logger, "{} of {} batches failed: {}", job_count - exported, job_count, error);
        }

        InvocationSummary {
            success: last_error.is_none(),
            exported_batches: exported,
            processed_records: processed,
            dropped_records: dropped,
            last_error,
        }
    }

    fn finish(&self, summary: &InvocationSummary, logger: &Logger) {
        self.pipeline_metrics
            .deliveries_finished
            .with_label_values(&[summary.status()])
            .inc();
        info!(
            logger, "delivery {}", summary.status();
            "exported_batches" => summary.exported_batches,
            "processed_records" => summary.processed_records,
            "dropped_records" => summary.dropped_records,
        );
    }
}

fn kind_label(classified: &ClassifiedEvent) -> &'static str {
    match classified {
        ClassifiedEvent::Ec2Audit { .. } => "ec2_audit",
        ClassifiedEvent::GenericAudit { .. } => "generic_audit",
        ClassifiedEvent::ClusterInsightsLog { .. } => "cluster_insights_log",
        ClassifiedEvent::AppLog(app) if app.is_fargate() => "fargate_app_log",
        ClassifiedEvent::AppLog(_) => "pod_app_log",
        ClassifiedEvent::ClusterInsightsPerformance { .. } => "cluster_insights_performance",
        ClassifiedEvent::Unknown => "unknown",
    }
}

fn populate_kubernetes_attributes(
    builder: &mut crate::otlp::LogsRequestBuilder,
    app: &AppLogEvent,
    identity: ContainerIdentity,
) {
    builder
        .set_kubernetes_cluster_uid(&app.cluster_uid)
        .set_kubernetes_pod_name(&app.kubernetes.pod_name)
        .set_kubernetes_namespace(&app.kubernetes.namespace_name)
        .set_kubernetes_pod_id(&app.kubernetes.pod_id)
        .set_kubernetes_container_name(&app.kubernetes.container_name)
        .set_kubernetes_container_image(&app.kubernetes.container_image)
        .set_kubernetes_docker_id(&app.kubernetes.docker_id)
        .set_kubernetes_labels(&app.kubernetes.labels)
        .set_kubernetes_annotations(&app.kubernetes.annotations)
        .set_kubernetes_manifest_version(&app.manifest_version, "1.0")
        .set_otel_attributes(
            &app.kubernetes.pod_name,
            app.kubernetes
                .labels
                .get("app")
                .map(String::as_str)
                .unwrap_or(&app.kubernetes.container_name),
        )
        .set_container_identity(identity);
}

/// Splits a payload whose scope carries more records than the per-request
/// cap into several payloads sharing the same resource attributes.
fn split_payload(payload: LogsData) -> Vec<LogsData> {
    let total: usize = payload
        .resource_logs
        .iter()
        .flat_map(|rl| rl.scope_logs.iter())
        .map(|sl| sl.log_records.len())
        .sum();
    if total <= MAX_RECORDS_PER_REQUEST {
        return vec![payload];
    }

    let mut chunks = Vec::new();
    for resource_logs in payload.resource_logs {
        let resource = resource_logs.resource;
        for scope_logs in resource_logs.scope_logs {
            let mut records = scope_logs.log_records;
            while !records.is_empty() {
                let take = records.len().min(MAX_RECORDS_PER_REQUEST);
                let chunk: Vec<_> = records.drain(..take).collect();
                chunks.push(LogsData {
                    resource_logs: vec![ResourceLogs {
                        resource: resource.clone(),
                        scope_logs: vec![ScopeLogs {
                            log_records: chunk,
                        }],
                    }],
                });
            }
        }
    }
    chunks
}
