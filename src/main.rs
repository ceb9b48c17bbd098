use anyhow::Context;
use clap::Parser;
use csv_relay::utils::error::EtlError;
use csv_relay::utils::{logger, validation::Validate};
use csv_relay::{AppConfig, CliArgs, PipelineOrchestrator, RunSummary};

const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    if args.log_json {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("Starting csv-relay");
    if args.verbose {
        tracing::debug!("CLI args: {:?}", args);
    }

    match run(&args).await {
        Ok(summary) => {
            print_summary(&summary);
            if summary.cancelled {
                eprintln!("🛑 Interrupted; rerun with --execution-id {} to resume", summary.execution_id);
                std::process::exit(EXIT_CANCELLED);
            }
        }
        Err(e) => {
            let exit_code = match e.downcast_ref::<EtlError>() {
                Some(etl) => {
                    tracing::error!(
                        "❌ Run failed: {:#} (Category: {:?}, Severity: {:?})",
                        e,
                        etl.category(),
                        etl.severity()
                    );
                    eprintln!("❌ {}", etl.user_friendly_message());
                    eprintln!("💡 Suggestion: {}", etl.recovery_suggestion());
                    etl.exit_code()
                }
                None => {
                    tracing::error!("❌ Run failed: {:#}", e);
                    eprintln!("❌ {:#}", e);
                    3
                }
            };
            std::process::exit(exit_code);
        }
    }
}

async fn run(args: &CliArgs) -> anyhow::Result<RunSummary> {
    let mut config = AppConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    config.apply_overrides(&args.overrides());
    config.validate()?;

    if args.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    let pipeline = PipelineOrchestrator::new(config, args.run_options())?;
    tracing::info!("🆔 Execution id: {}", pipeline.paths().execution_id);

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Ctrl-C received, finishing the current batch");
            cancel.cancel();
        }
    });

    let summary = pipeline.run().await?;
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("📋 Execution {}", summary.execution_id);
    println!("   Total lines:        {}", summary.total_lines);
    println!("   Processed:          {}", summary.processed);
    println!("   Success:            {}", summary.success);
    println!("   Errors:             {}", summary.errors);
    println!("   Validation errors:  {}", summary.validation_errors);
    println!("   Filtered:           {}", summary.filtered);
    println!("   Skipped:            {}", summary.skipped);
    println!("   Retries:            {}", summary.retries);
    println!("   Batches:            {}", summary.batches);
    println!("   Last line:          {}", summary.last_processed_line);
    match summary.min_response_ms {
        Some(min) => println!(
            "   Response time (ms): min {} / avg {:.1} / max {}",
            min, summary.avg_response_ms, summary.max_response_ms
        ),
        None => println!("   Response time (ms): n/a"),
    }
    if let Some(min) = summary.min_batch_ms {
        println!(
            "   Batch time (ms):    min {} / avg {:.1} / max {}",
            min, summary.avg_batch_ms, summary.max_batch_ms
        );
    }
    if !summary.status_codes.is_empty() {
        let codes: Vec<String> = summary
            .status_codes
            .iter()
            .map(|(code, count)| format!("{}×{}", code, count))
            .collect();
        println!("   Status codes:       {}", codes.join(", "));
    }
    println!("   Elapsed:            {:.1}s", summary.elapsed_seconds);
    println!("   Checkpoint:         {}", summary.checkpoint_path.display());
    println!("   Error log:          {}", summary.log_path.display());

    if summary.errors == 0 {
        println!("✅ Completed without errors");
    } else {
        println!("⚠️ Completed with {} error(s), see the error log", summary.errors);
    }
}
