use castfile::{
    args::TargetArgs,
    client::{self, Client, LoadMediaArgs, SessionState},
    payload::media::{PlayerState, IdleReason},
    resolver::{self, MediaPlan, Source, SubtitleRef, SUBTITLES_ROUTE, VIDEO_ROUTE},
    serve::{FileServer, ServedFile},
    types::{AppSession, MediaSession},
    Error,
};
use clap::Parser;
use futures::StreamExt;
use std::{
    io::Write,
    net::{IpAddr, SocketAddr},
    path::Path,
    process::ExitCode,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Cast a video file or URL (with optional subtitles) to a Chromecast.
#[derive(clap::Parser, Clone, Debug)]
#[command(version)]
struct Args {
    /// Local file path or http(s) URL of the media to play.
    source: String,

    /// Local file path or http(s) URL of a subtitle file.
    #[arg(long, value_name = "SUBS")]
    subs: Option<String>,

    #[clap(flatten)]
    target: TargetArgs,

    /// How long to browse for devices before giving up, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    discovery_timeout: u64,

    /// Treat this long in the IDLE player state as the end of playback.
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    idle_timeout: u64,

    /// Local IP to advertise to the device when serving files.
    ///
    /// Defaults to whichever local address routes to the device.
    #[arg(long, value_name = "IP")]
    local_ip: Option<IpAddr>,

    /// Local TCP port for the embedded file server. 0 picks a free port.
    #[arg(long, value_name = "PORT", default_value_t = 0)]
    local_port: u16,

    /// MIME type of the media, overriding the extension table.
    #[arg(long, value_name = "MIME")]
    media_type: Option<String>,

    /// MIME type of the subtitles, overriding the extension table.
    #[arg(long, value_name = "MIME")]
    subs_type: Option<String>,

    /// Playback start position in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.0)]
    start_time: f64,

    /// Log in bunyan JSON on stdout instead of human-readable on stderr.
    #[arg(long)]
    log_json: bool,
}

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging(args.log_json) {
        eprintln!("castfile: failed to initialise logging: {err}");
        return ExitCode::FAILURE;
    }

    tracing::debug!(?args, "args");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(&err);
            ExitCode::from(err.exit_code())
        },
    }
}

fn print_error(err: &Error) {
    eprintln!("castfile: {err}");

    let mut source = std::error::Error::source(err);
    while let Some(err) = source {
        eprintln!("  caused by: {err}");
        source = err.source();
    }
}

async fn run(args: Args) -> castfile::Result<()> {
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(?err, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    // Classify inputs before touching the network so bad arguments fail
    // fast.
    let media_source = resolver::resolve_media(&args.source, args.media_type.as_deref())?;
    let subs_source = args.subs.as_deref()
        .map(|subs| resolver::resolve_subtitles(subs, args.subs_type.as_deref()))
        .transpose()?;

    let discovery_timeout = Duration::from_secs(args.discovery_timeout);

    let addr = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = args.target.resolve_to_socket_addr(discovery_timeout) => res?,
    };

    tracing::info!(%addr, "connecting to cast device");

    let config = client::Config {
        addr,
        sender: None, // Use default
    };
    let mut client = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = config.connect() => res?,
    };

    let session = start_session(
        &mut client, &cancel, addr, &args, media_source, subs_source).await;

    let session = match session {
        Ok(Some(session)) => session,
        Ok(None) => {
            // Interrupted mid-launch; nothing to report.
            shutdown(client, None, None, None, &cancel).await;
            return Ok(());
        },
        Err(err) => {
            shutdown(client, None, None, None, &cancel).await;
            return Err(err);
        },
    };

    let res = playback_loop(&mut client, &cancel, &session,
                            Duration::from_secs(args.idle_timeout)).await;

    shutdown(client,
             Some(session.app_session),
             session.media_session,
             session.server,
             &cancel).await;

    res
}

struct Session {
    app_session: AppSession,
    media_session: Option<MediaSession>,
    server: Option<FileServer>,
}

/// Serves any local files, launches the default receiver and loads the
/// media onto it.
async fn start_session(client: &mut Client,
                       cancel: &CancellationToken,
                       device_addr: SocketAddr,
                       args: &Args,
                       media_source: Source,
                       subs_source: Option<Source>)
-> castfile::Result<Option<Session>>
{
    let mut files = Vec::new();

    if let Some(path) = media_source.local_path() {
        files.push(ServedFile {
            route: VIDEO_ROUTE,
            path: path.to_path_buf(),
            content_type: media_source.content_type().to_string(),
        });
    }
    if let Some(subs) = &subs_source {
        if let Some(path) = subs.local_path() {
            files.push(ServedFile {
                route: SUBTITLES_ROUTE,
                path: path.to_path_buf(),
                content_type: subs.content_type().to_string(),
            });
        }
    }

    let (server, base_url) = if files.is_empty() {
        (None, None)
    } else {
        let local_ip = match args.local_ip {
            Some(ip) => ip,
            None => resolver::local_ip_for(device_addr.ip())?,
        };

        let bind_ip: IpAddr = match local_ip {
            IpAddr::V4(_) => [0, 0, 0, 0].into(),
            IpAddr::V6(_) => [0u16, 0, 0, 0, 0, 0, 0, 0].into(),
        };

        let server = FileServer::start(
            SocketAddr::new(bind_ip, args.local_port),
            files,
            cancel.child_token()).await?;

        // The advertised URL carries the routable address, not the
        // wildcard one we bound to.
        let advertised = SocketAddr::new(local_ip, server.local_addr().port());

        (Some(server), Some(format!("http://{advertised}")))
    };

    let url_for = |source: &Source, route: &str| match source {
        Source::Remote { url, .. } => url.clone(),
        Source::Local { .. } => {
            let base = base_url.as_deref().unwrap_or_default();
            format!("{base}{route}")
        },
    };

    let plan = MediaPlan {
        content_url: url_for(&media_source, VIDEO_ROUTE),
        content_type: media_source.content_type().to_string(),
        subtitles: subs_source.as_ref().map(|subs| SubtitleRef {
            url: url_for(subs, SUBTITLES_ROUTE),
            content_type: subs.content_type().to_string(),
        }),
    };

    tracing::info!(content_url = plan.content_url,
                   content_type = plan.content_type,
                   subtitles = ?plan.subtitles,
                   "media plan");

    let title = media_source.local_path()
        .and_then(Path::file_stem)
        .and_then(|stem| stem.to_str())
        .map(ToString::to_string);

    let launch = async {
        let (app_session, _receiver_status) = client.media_launch_default().await?;

        // Always a fresh LOAD; whatever the receiver was doing before is
        // replaced.
        let status = client.media_load(&app_session, LoadMediaArgs {
            media: plan.to_media(title),
            current_time: args.start_time,
            autoplay: true,
            preload_time: None,
            active_track_ids: plan.active_track_ids(),
        }).await?;

        let media_session = status.try_find_media_session_id().ok()
            .map(|media_session_id| MediaSession {
                app_session: app_session.clone(),
                media_session_id,
            });

        Ok::<_, Error>(Session {
            app_session,
            media_session,
            server: None,
        })
    };

    let mut session = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("interrupted during launch");
            return Ok(None);
        },
        res = launch => res?,
    };

    session.server = server;

    Ok(Some(session))
}

/// Follows playback until it ends, fails, or the user interrupts.
async fn playback_loop(client: &mut Client,
                       cancel: &CancellationToken,
                       session: &Session,
                       idle_timeout: Duration)
-> castfile::Result<()>
{
    let mut state_rx = client.watch_state();
    let mut updates = Box::pin(client.listen_status());

    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // IDLE without a FINISHED reason is ambiguous: it happens before the
    // first load and when another sender interferes. Only a sustained
    // stretch of it counts as the end of playback.
    let mut idle_since: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("playback interrupted");
                return Ok(());
            },

            res = state_rx.changed() => {
                if res.is_err() {
                    return Err(take_session_error(client));
                }

                let state = *state_rx.borrow_and_update();
                tracing::debug!(%state, "session state change");

                match state {
                    SessionState::Ended => {
                        println!();
                        tracing::info!("playback finished");
                        return Ok(());
                    },
                    SessionState::Error => {
                        return Err(take_session_error(client));
                    },
                    _ => {},
                }
            },

            Some(update) = updates.next() => {
                tracing::debug!(?update, "status update");
            },

            _ = poll.tick() => {
                let status = match client.media_status(&session.app_session, None).await {
                    Ok(status) => status,
                    // A dead connection task reports its real reason
                    // through the fatal slot.
                    Err(err) => return Err(client.take_fatal_error().unwrap_or(err)),
                };

                let Some(entry) = status.entries.first() else {
                    if idle_elapsed(&mut idle_since) > idle_timeout {
                        println!();
                        tracing::info!("no media session left, treating as finished");
                        return Ok(());
                    }
                    continue;
                };

                let player_state = entry.player_state;
                let finished = player_state == PlayerState::Idle
                    && entry.idle_reason == Some(IdleReason::Finished);

                if finished {
                    println!();
                    tracing::info!("playback finished");
                    return Ok(());
                }

                if player_state == PlayerState::Idle {
                    if idle_elapsed(&mut idle_since) > idle_timeout {
                        println!();
                        tracing::info!("player idle too long, treating as finished");
                        return Ok(());
                    }
                } else {
                    idle_since = None;
                }

                print_status_line(
                    entry.current_time.unwrap_or(0.0),
                    entry.media.as_ref().and_then(|m| m.duration),
                    player_state);
            },
        }
    }
}

/// Time spent idle so far, starting the clock on first call.
fn idle_elapsed(idle_since: &mut Option<tokio::time::Instant>) -> Duration {
    idle_since.get_or_insert_with(tokio::time::Instant::now).elapsed()
}

fn take_session_error(client: &Client) -> Error {
    client.take_fatal_error().unwrap_or_else(|| Error::TransportLost(
        anyhow::format_err!("connection task stopped unexpectedly")))
}

fn print_status_line(current_time: f64, duration: Option<f64>, state: PlayerState) {
    let duration = duration
        .map(fmt_time)
        .unwrap_or_else(|| "-:--:--".to_string());

    print!("{current}/{duration} {state}   \r",
           current = fmt_time(current_time));
    let _ = std::io::stdout().flush();
}

fn fmt_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{hours}:{minutes:02}:{seconds:02}",
            hours = total / 3600,
            minutes = (total % 3600) / 60,
            seconds = total % 60)
}

/// Best-effort teardown: stop the media, stop the app, close the
/// connection, stop the file server. Each step is bounded and a failure
/// never masks the run's own result.
async fn shutdown(mut client: Client,
                  app_session: Option<AppSession>,
                  media_session: Option<MediaSession>,
                  server: Option<FileServer>,
                  cancel: &CancellationToken)
{
    if let Some(media_session) = media_session {
        let res = tokio::time::timeout(
            SHUTDOWN_STEP_TIMEOUT,
            client.media_stop(&media_session)).await;
        match res {
            Ok(Ok(_)) => {},
            Ok(Err(err)) => tracing::debug!(?err, "media stop failed during shutdown"),
            Err(_) => tracing::debug!("media stop timed out during shutdown"),
        }
    }

    if let Some(app_session) = app_session {
        let res = tokio::time::timeout(
            SHUTDOWN_STEP_TIMEOUT,
            client.receiver_stop_app(app_session)).await;
        match res {
            Ok(Ok(_)) => {},
            Ok(Err(err)) => tracing::debug!(?err, "app stop failed during shutdown"),
            Err(_) => tracing::debug!("app stop timed out during shutdown"),
        }
    }

    if let Err(err) = client.close().await {
        tracing::debug!(?err, "client close failed during shutdown");
    }

    cancel.cancel();

    if let Some(server) = server {
        if tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, server.join()).await.is_err() {
            tracing::debug!("file server did not stop in time");
        }
    }
}

#[derive(Eq, PartialEq)]
enum LogMode {
    PrettyAnsi,
    Pretty,
    Json,
}

fn init_logging(log_json: bool) -> anyhow::Result<()> {
    use std::io::IsTerminal;
    use tracing_bunyan_formatter::{
        BunyanFormattingLayer,
        JsonStorageLayer,
    };
    use tracing_subscriber::{
        EnvFilter,
        filter::LevelFilter,
        fmt,
        prelude::*,
    };

    let log_mode =
        if log_json {
            LogMode::Json
        } else if std::io::stderr().is_terminal() {
            LogMode::PrettyAnsi
        } else {
            LogMode::Pretty
        };

    tracing_subscriber::Registry::default()
        .with(match log_mode {
                  LogMode::PrettyAnsi | LogMode::Pretty => {
                      Some(fmt::Layer::new()
                               .event_format(fmt::format()
                                                 .pretty()
                                                 .with_ansi(log_mode == LogMode::PrettyAnsi)
                                                 .with_timer(fmt::time::UtcTime::<_>::
                                                                 rfc_3339())
                                                 .with_target(true)
                                                 .with_source_location(true))
                               .with_ansi(log_mode == LogMode::PrettyAnsi)
                               .with_writer(std::io::stderr))
                  },
                  _ => None,
             })
        .with(if log_mode == LogMode::Json {
                  Some(JsonStorageLayer
                           .and_then(BunyanFormattingLayer::new(
                               env!("CARGO_CRATE_NAME").to_string(),
                               std::io::stdout)))
              } else {
                  None
              })
        // Global filter
        .with(EnvFilter::builder()
                  .with_default_directive(LevelFilter::INFO.into())
                  .parse(std::env::var("RUST_LOG")
                             .unwrap_or(format!("warn,{crate_}=info",
                                                crate_ = env!("CARGO_CRATE_NAME"))))?)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fmt_time_formats_h_mm_ss() {
        assert_eq!(fmt_time(0.0), "0:00:00");
        assert_eq!(fmt_time(59.9), "0:00:59");
        assert_eq!(fmt_time(61.0), "0:01:01");
        assert_eq!(fmt_time(3661.0), "1:01:01");
        assert_eq!(fmt_time(-5.0), "0:00:00");
    }
}
