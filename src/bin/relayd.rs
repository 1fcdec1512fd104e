//! relayd - stream relay daemon
//!
//! This daemon:
//! 1. Resolves the stream from the fleet API (by serial) or local configuration
//! 2. Captures frames on a dedicated thread, reconnecting on failure
//! 3. Runs detection and overlays on a second thread
//! 4. Watches both stages and forces reconnects when they stall
//! 5. Serves the AI and clean feeds to WebRTC viewers
//! 6. Posts new tracked detections to the notification sink

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use stream_relay::{
    config::RelayConfig,
    dedup::DuplicateSuppressor,
    detect::{build_backend, InferParams},
    fleet::FleetClient,
    frame::PipelineSlots,
    ingest::{redact_url, url_factory, SourceTimeouts},
    notify::{self, HttpSink, NotificationJob, NotificationSink, StreamIdentity},
    overlay::OverlayPainter,
    pipeline::{
        CaptureLoop, InferenceSettings, InferenceStage, PipelineState, StreamConnector, Watchdog,
    },
    server::{self, AppState, PacingSettings, SessionManager},
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "relayd",
    about = "Relay a live camera stream with object detection to WebRTC viewers"
)]
struct Args {
    /// Device serial number to look up in the fleet API.
    #[arg(short = 's', long = "drone-serial", env = "DRONE_SERIAL")]
    drone_serial: Option<String>,

    /// Fleet API base URL.
    #[arg(long = "api-url", env = "DRONE_API_URL")]
    api_url: Option<String>,

    /// Start even if the device reports its stream as off.
    #[arg(long)]
    skip_stream_check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = RelayConfig::load()?;
    if let Some(api_url) = args.api_url.clone() {
        cfg.fleet_api_url = api_url;
    }
    resolve_device(&mut cfg, &args)?;

    log::info!(
        "relayd {} starting: {} ({}) from {}",
        env!("CARGO_PKG_VERSION"),
        cfg.stream.name,
        cfg.stream.device_type,
        redact_url(&cfg.stream.url)
    );

    let state = Arc::new(PipelineState::new());
    let slots = PipelineSlots::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let state = state.clone();
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            state.request_stop();
            let _ = shutdown_tx.send(true);
        })
        .context("install shutdown handler")?;
    }

    let mut backend = build_backend(&cfg.detector)?;
    backend
        .warm_up()
        .with_context(|| format!("warm up {} detector", backend.name()))?;
    log::info!("detector backend: {}", backend.name());

    let connector = Arc::new(StreamConnector::new(
        url_factory(
            cfg.stream.url.clone(),
            cfg.capture.output_width,
            cfg.capture.output_height,
        ),
        SourceTimeouts {
            open: cfg.capture.open_timeout,
            read: cfg.capture.read_timeout,
        },
    ));
    let (queue, notify_rx) = notify::channel(cfg.notify.queue_capacity);

    let capture = CaptureLoop::new(
        connector.clone(),
        slots.raw.clone(),
        slots.clean.clone(),
        state.clone(),
        cfg.capture.reconnect_delay,
    );
    let inference = InferenceStage::new(
        backend,
        slots.raw.clone(),
        slots.ai.clone(),
        state.clone(),
        OverlayPainter::load(cfg.font_path.as_deref())?,
        DuplicateSuppressor::new(cfg.notify.cooldown, cfg.notify.spatial_threshold_px),
        queue,
        InferenceSettings {
            output_width: cfg.capture.output_width,
            output_height: cfg.capture.output_height,
            process_every_n: cfg.detector.process_every_n_frames,
            params: InferParams {
                confidence_threshold: cfg.detector.confidence_threshold,
                iou_threshold: cfg.detector.iou_threshold,
                allowed_classes: cfg.detector.classes.clone(),
            },
            identity: StreamIdentity {
                name: cfg.stream.name.clone(),
                device_type: cfg.stream.device_type.clone(),
            },
        },
    );
    let watchdog = Watchdog::new(
        state.clone(),
        slots.raw.clone(),
        slots.ai.clone(),
        cfg.watchdog.interval,
        cfg.watchdog.timeout,
        cfg.watchdog.stall_grace,
    );

    let capture_thread = spawn_worker("capture", move || capture.run())?;
    let inference_thread = spawn_worker("inference", move || inference.run())?;
    let watchdog_thread = spawn_worker("watchdog", move || watchdog.run())?;

    let app = AppState {
        sessions: Arc::new(SessionManager::new(
            cfg.server.ice_servers.clone(),
            &slots,
            cfg.capture.output_width,
            cfg.capture.output_height,
            PacingSettings {
                fps: cfg.server.publish_fps,
                jpeg_quality: cfg.server.jpeg_quality,
            },
        )),
        pipeline: state.clone(),
        stream_name: Arc::from(cfg.stream.name.as_str()),
        shutdown: shutdown_rx,
    };
    let sink: Arc<dyn NotificationSink> =
        Arc::new(HttpSink::new(cfg.notify.endpoint.clone(), cfg.notify.timeout));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build event loop")?;
    let served = runtime.block_on(event_loop(&cfg, app, notify_rx, sink, &shutdown_tx));
    runtime.shutdown_timeout(Duration::from_secs(2));

    // Workers observe the stop flag within one read or sleep slice.
    state.request_stop();
    join_worker(capture_thread);
    join_worker(watchdog_thread);
    let backend = join_worker(inference_thread);

    connector.release();
    log::info!("capture handle released");
    if let Some(mut backend) = backend {
        backend.release_scratch();
        log::info!("{} detector released", backend.name());
    }

    log::info!("relayd stopped");
    served
}

/// Overlay the fleet profile for `--drone-serial` onto `cfg`, then report our
/// viewer address back to the fleet API.
fn resolve_device(cfg: &mut RelayConfig, args: &Args) -> Result<()> {
    let fleet = FleetClient::new(cfg.fleet_api_url.clone());
    let serial = args
        .drone_serial
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if let Some(serial) = serial {
        log::info!("fetching device {} from {}", serial, cfg.fleet_api_url);
        match fleet.fetch_device(serial) {
            Ok(profile) => {
                if !profile.stream_is_on && !args.skip_stream_check {
                    return Err(anyhow!(
                        "device {} reports its stream is off; turn it on or pass --skip-stream-check",
                        profile.serial
                    ));
                }
                log::info!(
                    "device {}: {} ({})",
                    profile.serial,
                    profile.display_name,
                    profile.category
                );
                cfg.apply_device_profile(&profile);
            }
            Err(err) => {
                log::warn!(
                    "device lookup failed, using local configuration: {:#}",
                    err
                );
                cfg.stream.serial = serial.to_string();
            }
        }
    }

    if cfg.stream.has_known_serial() {
        let webrtc_url = cfg.public_base_url();
        match fleet.report_webrtc_url(&cfg.stream.serial, &webrtc_url) {
            Ok(()) => log::info!("registered webRTCUrl {}", webrtc_url),
            Err(err) => log::warn!("could not register webRTCUrl: {:#}", err),
        }
    }
    Ok(())
}

async fn event_loop(
    cfg: &RelayConfig,
    app: AppState,
    notify_rx: mpsc::Receiver<NotificationJob>,
    sink: Arc<dyn NotificationSink>,
    shutdown_tx: &watch::Sender<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr())
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr()))?;
    let base = cfg.public_base_url();
    log::info!("AI feed: {}/ai", base);
    log::info!("clean feed: {}", base);

    let router = server::router(&cfg.stream.serial, app.clone());
    let mut server_task = tokio::spawn(server::serve(
        listener,
        router,
        wait_for_shutdown(app.shutdown.clone()),
    ));
    let worker_task = tokio::spawn(notify::run_worker(notify_rx, sink, app.pipeline.clone()));
    let heartbeat_task = tokio::spawn(server::heartbeat(app.clone(), HEARTBEAT_INTERVAL));

    let mut outcome = Ok(());
    tokio::select! {
        _ = wait_for_shutdown(app.shutdown.clone()) => {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, &mut server_task).await {
                Ok(Ok(result)) => outcome = result,
                Ok(Err(err)) => log::error!("server task failed: {}", err),
                Err(_) => {
                    log::warn!("server did not stop in time");
                    server_task.abort();
                }
            }
        }
        result = &mut server_task => {
            outcome = match result {
                Ok(Ok(())) => Err(anyhow!("server exited unexpectedly")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(anyhow!("server task failed: {}", err)),
            };
            app.pipeline.request_stop();
            let _ = shutdown_tx.send(true);
        }
    }

    match tokio::time::timeout(TASK_STOP_TIMEOUT, worker_task).await {
        Ok(Ok(accepted)) => log::info!("notification worker stopped ({} delivered)", accepted),
        Ok(Err(err)) => log::error!("notification worker failed: {}", err),
        Err(_) => log::warn!("notification worker did not stop in time"),
    }
    if tokio::time::timeout(TASK_STOP_TIMEOUT, heartbeat_task)
        .await
        .is_err()
    {
        log::warn!("heartbeat did not stop in time");
    }

    let closed = app.sessions.close_all().await;
    log::info!("closed {} viewer sessions", closed);
    outcome
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn spawn_worker<T, F>(name: &str, body: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .with_context(|| format!("spawn {} thread", name))
}

fn join_worker<T>(handle: JoinHandle<T>) -> Option<T> {
    let name = handle.thread().name().unwrap_or("worker").to_string();
    match handle.join() {
        Ok(value) => {
            log::info!("{} thread joined", name);
            Some(value)
        }
        Err(_) => {
            log::error!("{} thread panicked", name);
            None
        }
    }
}
