use axum::Router;
use clap::{Args, Parser, Subcommand};
use relay_common::config::Settings;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "RelayServe batching front-end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bind the HTTP surface and serve requests.
    Serve,
    /// Run a single prompt through the engine, bypassing HTTP.
    Run(RunArgs),
    /// Print probed devices and host resource usage.
    Stats,
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long)]
    prompt: String,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Run(args) => run_once(args).await,
        Commands::Stats => stats().await,
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

async fn serve() {
    let settings = Settings::from_env();
    let port = settings.port;
    let app: Router = match relay_api::app(settings) {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(target: "relay-cli", error = %err, "engine construction failed");
            eprintln!("fatal: {err}");
            std::process::exit(1);
        }
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await.unwrap();
    tracing::info!(target: "relay-cli", %port, "listening");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target: "relay-cli", "shutdown signal received");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();
}

async fn run_once(args: RunArgs) {
    let settings = Settings::from_env();
    let engine = match relay_api::build_engine(&settings) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("fatal: {err}");
            std::process::exit(1);
        }
    };
    let outcome = engine.handle_chat(args.prompt).await;
    println!("{}", outcome.reply);
    println!(
        "device={} backend={} queue_ms={:.2} ttft_ms={:.2} batch_size={}",
        outcome.meta.device,
        outcome.meta.backend,
        outcome.meta.queue_ms,
        outcome.meta.ttft_ms,
        outcome.meta.batch_size,
    );
}

async fn stats() {
    use sysinfo::{CpuExt, System, SystemExt};

    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 =
        sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len().max(1) as f32);
    println!("CPU: {:.1}%", cpu_avg);
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);

    println!("\nProbed devices:");
    for device in relay_api::probe::probe_devices() {
        println!(
            "- {}:{} vram_gb={:.1} tflops={:.1} bandwidth_gbps={:.1} strength={:.2}",
            device.backend,
            device.name,
            device.vram_gb,
            device.tflops,
            device.bandwidth_gbps,
            device.strength_score(),
        );
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
