//! Operator console for a running engine, fed line by line from stdin

use anyhow::{Context, Result};
use groupcast_bulk::parse_messages;
use groupcast_config::parse_client_rules;
use groupcast_core::{BacklogOptions, DispatchError, Dispatcher};
use groupcast_ipc::ControlCommand;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Cut-off `hours` before now, in unix milliseconds.
pub fn since_hours(hours: u64) -> i64 {
    let window = i64::try_from(hours.saturating_mul(3_600_000)).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp_millis().saturating_sub(window)
}

fn backlog_options(hours: Option<u64>, limit: usize) -> BacklogOptions {
    BacklogOptions {
        since: hours.map(since_hours),
        limit_per_destination: limit,
    }
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}

fn changed(done: bool, what: &str) -> String {
    if done {
        format!("{} ok", what)
    } else {
        format!("{}: nothing to do", what)
    }
}

/// Run one command and describe the outcome for the operator.
pub async fn execute(
    dispatcher: &Dispatcher,
    command: ControlCommand,
    backlog_limit: usize,
) -> Result<(Flow, String)> {
    let output = match command {
        ControlCommand::Start => {
            dispatcher.start().await;
            "engine running".to_string()
        }
        ControlCommand::Stop => {
            dispatcher.stop();
            "engine stopped".to_string()
        }
        ControlCommand::Status => render(&dispatcher.status().await),
        ControlCommand::Flush => match dispatcher.flush().await {
            Ok(report) => render(&report),
            Err(DispatchError::ForwardingDisabled) => "forwarding is disabled".to_string(),
            Err(e) => return Err(e.into()),
        },
        ControlCommand::ForwardClear => {
            format!("removed {} queued forward(s)", dispatcher.clear_forward()?)
        }
        ControlCommand::IntakePause => changed(dispatcher.pause_intake(), "intake pause"),
        ControlCommand::IntakeResume => changed(dispatcher.resume_intake(), "intake resume"),
        ControlCommand::IntakeClear => {
            format!("removed {} queued message(s)", dispatcher.clear_intake())
        }
        ControlCommand::SetRate(rate_per_minute) => {
            let mut settings = dispatcher.settings();
            settings.engine.rate_per_minute = rate_per_minute;
            dispatcher.update_settings(settings)?;
            format!("rate set to {}/min", rate_per_minute)
        }
        ControlCommand::SetCooldown(cooldown_seconds) => {
            let mut settings = dispatcher.settings();
            settings.engine.cooldown_seconds = cooldown_seconds;
            dispatcher.update_settings(settings)?;
            format!("cooldown set to {}s", cooldown_seconds)
        }
        ControlCommand::ClientsReload { source } => {
            let raw = tokio::fs::read_to_string(&source)
                .await
                .with_context(|| format!("cannot read client list {}", source.display()))?;
            let mut settings = dispatcher.settings();
            settings.clients = parse_client_rules(&raw, &settings.engine.default_emoji);
            let count = settings.clients.len();
            dispatcher.update_settings(settings)?;
            format!("{} client rule(s) active", count)
        }
        ControlCommand::BulkStart {
            destination,
            source,
            delay_seconds,
            rate_per_minute,
        } => {
            let raw = tokio::fs::read_to_string(&source)
                .await
                .with_context(|| format!("cannot read campaign file {}", source.display()))?;
            let status = dispatcher
                .bulk_start(&destination, parse_messages(&raw), delay_seconds, rate_per_minute)
                .await?;
            format!(
                "campaign started: {} message(s) to {}",
                status.total_count, destination
            )
        }
        ControlCommand::BulkPause => changed(dispatcher.bulk_pause()?, "bulk pause"),
        ControlCommand::BulkResume => changed(dispatcher.bulk_resume()?, "bulk resume"),
        ControlCommand::BulkStop => changed(dispatcher.bulk_stop()?, "bulk stop"),
        ControlCommand::BulkStatus => render(&dispatcher.bulk_status()),
        ControlCommand::BacklogCheck { hours } => {
            render(&dispatcher.backlog_check(backlog_options(hours, backlog_limit)).await?)
        }
        ControlCommand::BacklogProcess { hours } => {
            render(&dispatcher.backlog_process(backlog_options(hours, backlog_limit)).await?)
        }
        ControlCommand::Help => ControlCommand::help().to_string(),
        ControlCommand::Quit => return Ok((Flow::Quit, "bye".to_string())),
    };
    Ok((Flow::Continue, output))
}

/// Read commands from stdin until `quit` or end of input.
pub async fn run(dispatcher: &Dispatcher, backlog_limit: usize) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", ControlCommand::help());
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match ControlCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        match execute(dispatcher, command, backlog_limit).await {
            Ok((flow, output)) => {
                println!("{}", output);
                if flow == Flow::Quit {
                    break;
                }
            }
            Err(e) => println!("error: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupcast_config::Settings;
    use groupcast_storage::{keys, load};
    use groupcast_ipc::testing::RecordingTransport;
    use groupcast_ipc::Transport;
    use groupcast_storage::{MemoryStore, StateStore};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn dispatcher_over(store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::open(
            Settings::default(),
            store as Arc<dyn StateStore>,
            Arc::new(RecordingTransport::new()) as Arc<dyn Transport>,
        )
        .expect("dispatcher")
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_over(Arc::new(MemoryStore::new()))
    }

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("groupcast-{}-{}.txt", name, ts));
        std::fs::write(&path, contents).expect("write");
        path
    }

    #[test]
    fn since_hours_counts_back_from_now() {
        let now = chrono::Utc::now().timestamp_millis();
        let since = since_hours(2);
        assert!(now - since >= 7_200_000);
        assert!(now - since < 7_260_000);
    }

    #[tokio::test]
    async fn bulk_start_reads_campaign_file() {
        let path = temp_file("campaign", "first\n\nsecond\n");

        let dispatcher = dispatcher();
        let command =
            ControlCommand::parse(&format!("bulk start list@g.us {} 0 100", path.display()))
                .expect("parse");
        let (flow, output) = execute(&dispatcher, command, 100).await.expect("execute");
        assert_eq!(flow, Flow::Continue);
        assert!(output.contains("2 message(s)"));
        assert_eq!(dispatcher.bulk_status().total_count, 2);
        dispatcher.bulk_stop().expect("stop");
    }

    #[tokio::test]
    async fn flush_without_target_is_reported() {
        let dispatcher = dispatcher();
        let (_, output) = execute(&dispatcher, ControlCommand::Flush, 100)
            .await
            .expect("execute");
        assert_eq!(output, "forwarding is disabled");

        let (flow, _) = execute(&dispatcher, ControlCommand::Quit, 100)
            .await
            .expect("execute");
        assert_eq!(flow, Flow::Quit);
    }

    #[tokio::test]
    async fn settings_commands_apply_and_persist() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher_over(Arc::clone(&store));

        let (_, output) = execute(&dispatcher, ControlCommand::SetRate(9), 100)
            .await
            .expect("set rate");
        assert_eq!(output, "rate set to 9/min");
        execute(&dispatcher, ControlCommand::SetCooldown(0), 100)
            .await
            .expect("set cooldown");
        assert!(execute(&dispatcher, ControlCommand::SetRate(0), 100)
            .await
            .is_err());

        let path = temp_file("clients", "Sara | 🔥\n# comment\nOmar\n");
        let (_, output) = execute(&dispatcher, ControlCommand::ClientsReload { source: path }, 100)
            .await
            .expect("reload");
        assert_eq!(output, "2 client rule(s) active");

        let status = dispatcher.status().await;
        assert_eq!(status.rate_per_minute, 9);
        assert_eq!(status.cooldown_seconds, 0);
        assert_eq!(status.clients, 2);
        let persisted: Settings = load(store.as_ref(), keys::SETTINGS)
            .expect("load")
            .expect("persisted");
        assert_eq!(persisted.engine.rate_per_minute, 9);
        assert_eq!(persisted.clients[0].name, "Sara");
    }

    #[tokio::test]
    async fn intake_controls_report_changes() {
        let dispatcher = dispatcher();
        let (_, output) = execute(&dispatcher, ControlCommand::IntakePause, 100)
            .await
            .expect("pause");
        assert_eq!(output, "intake pause ok");
        let (_, output) = execute(&dispatcher, ControlCommand::IntakePause, 100)
            .await
            .expect("pause again");
        assert_eq!(output, "intake pause: nothing to do");
        let (_, output) = execute(&dispatcher, ControlCommand::IntakeClear, 100)
            .await
            .expect("clear");
        assert_eq!(output, "removed 0 queued message(s)");
    }
}
