//! One-turn orchestration.
//!
//! A turn composes the prompt from the live workspace, streams the model
//! exchange, and forwards typed events to the caller in a fixed order:
//! `FilesIncluded`, then text chunks in model order, then at most one
//! `Usage`, then the terminator. The explicit apply path parses the
//! envelope, runs the applier, and records the post-apply snapshot.
//! Callers serialize turns; nothing here is shared between them.

use std::path::{Path, PathBuf};

use anyhow::Result;
use atelier_providers::GatewayRequest;
use atelier_types::{ChatMessage, SessionEvent, Settings, StreamEvent};
use atelier_workspace::{SnapshotStore, read_workspace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::applier::{ApplyReport, apply_edits};
use crate::composer::{ComposedPrompt, compose_prompt};
use crate::envelope::parse_changes;
use crate::optimizer::{optimize_history, window_history};

/// Suffix of post-apply snapshot labels.
pub const SNAPSHOT_LABEL_SUFFIX: &str = "_ai_change";

/// One conversation's binding of settings to a workspace.
#[derive(Debug)]
pub struct Session {
    settings: Settings,
    workspace_root: PathBuf,
    snapshots: SnapshotStore,
    system_prompt: Option<String>,
}

impl Session {
    /// Bind `settings` to a workspace. The system prompt is read once from
    /// the path selected by `(apiProvider, strategy)`; a missing file is
    /// logged and the exchange proceeds without one.
    #[must_use]
    pub fn new(settings: Settings, workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let system_prompt = settings.system_prompt_path().and_then(|path| {
            match std::fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "Failed to read system prompt: {err}");
                    None
                }
            }
        });

        Self {
            snapshots: SnapshotStore::new(workspace_root.clone()),
            settings,
            workspace_root,
            system_prompt,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Run one model turn: compose, stream, forward.
    ///
    /// Returns the composed prompt so the caller can store it as the
    /// turn's `full_text` in history. On cancellation the event sequence
    /// simply stops; no `Usage`, no terminator.
    pub async fn run_turn(
        &self,
        history: &[ChatMessage],
        user_text: &str,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<ComposedPrompt> {
        let digest = read_workspace(&self.workspace_root);
        let strategy = self.settings.code_change_strategy;
        let composed = compose_prompt(&digest, strategy, user_text);

        tx.send(SessionEvent::FilesIncluded {
            files: composed.included_files.clone(),
            prompt: composed.prompt.clone(),
        })
        .await?;

        let optimized = if self.settings.optimize_code_context {
            optimize_history(history, &digest, strategy)
        } else {
            history.to_vec()
        };
        let windowed = window_history(&optimized, self.settings.max_context_history_turns);

        let (gateway_tx, mut gateway_rx) = mpsc::channel::<StreamEvent>(64);
        let request = GatewayRequest {
            system_prompt: self.system_prompt.as_deref(),
            history: &windowed,
            user_prompt: &composed.prompt,
        };

        let forward = async {
            while let Some(event) = gateway_rx.recv().await {
                let mapped = match event {
                    StreamEvent::TextDelta(chunk) => SessionEvent::TextChunk(chunk),
                    StreamEvent::Usage(usage) => {
                        let display = &self.settings.display_token_consumption;
                        if !display.enabled {
                            continue;
                        }
                        SessionEvent::Usage {
                            usage,
                            display: display.display_types.clone(),
                        }
                    }
                    StreamEvent::Done => SessionEvent::Done,
                    StreamEvent::Error(message) => SessionEvent::Error(message),
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        };

        let (sent, ()) = tokio::join!(
            atelier_providers::send_message(&self.settings, request, cancel, gateway_tx),
            forward,
        );
        sent?;

        Ok(composed)
    }

    /// Parse the envelope in `model_output` and apply it.
    ///
    /// An envelope parse failure aborts with an `Error` event before any
    /// file is touched. After at least one successful edit, a forced
    /// snapshot is recorded and announced; a snapshot failure is logged
    /// but does not retract the apply.
    pub async fn apply_model_output(
        &self,
        model_output: &str,
        message_id: Option<String>,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<ApplyReport> {
        let edits = match parse_changes(model_output) {
            Ok(edits) => edits,
            Err(err) => {
                let _ = tx
                    .send(SessionEvent::Error(format!("Cannot apply changes: {err}")))
                    .await;
                return Err(err.into());
            }
        };

        let report = apply_edits(&self.workspace_root, &edits).await;

        if report.any_applied() {
            let label = format!(
                "{}{SNAPSHOT_LABEL_SUFFIX}",
                chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S")
            );
            match self.snapshots.create(&label, true) {
                Ok(_) => {
                    let _ = tx
                        .send(SessionEvent::SnapshotCreated {
                            label,
                            message_id,
                        })
                        .await;
                }
                Err(err) => {
                    tracing::error!("Post-apply snapshot failed: {err}");
                }
            }
        }

        Ok(report)
    }

    /// Record an initial-state snapshot before the first destructive
    /// operation of a conversation. Elides against the latest snapshot.
    pub fn snapshot_initial_state(&self) -> Result<bool> {
        let label = format!("{}_initial", chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S"));
        Ok(self.snapshots.create(&label, false)?.created())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn session(dir: &Path) -> Session {
        let root = dir.join("project");
        fs::create_dir_all(&root).unwrap();
        fs::write(
            root.join("src.ts"),
            "export function greet() { return \"hi\"; }\nexport const X = 1;\n",
        )
        .unwrap();
        Session::new(Settings::default(), root)
    }

    async fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn apply_block_edit_rewrites_file_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let output = r#"<changes>
  <file_update>
    <file>src.ts</file>
    <operations>
      <block>
        <path><![CDATA[greet]]></path>
        <content><![CDATA[export function greet() { return "hello"; }]]></content>
      </block>
    </operations>
  </file_update>
</changes>"#;

        let (tx, mut rx) = mpsc::channel(16);
        let report = session
            .apply_model_output(output, Some("m1".to_string()), &tx)
            .await
            .unwrap();

        assert_eq!(report.applied, vec!["src.ts"]);
        assert_eq!(
            fs::read_to_string(session.workspace_root().join("src.ts")).unwrap(),
            "export function greet() { return \"hello\"; }\n\nexport const X = 1;\n"
        );

        let events = drain(&mut rx).await;
        assert!(matches!(
            &events[..],
            [SessionEvent::SnapshotCreated { label, message_id }]
                if label.ends_with(SNAPSHOT_LABEL_SUFFIX) && message_id.as_deref() == Some("m1")
        ));

        let label = session.snapshots().latest_label().unwrap();
        assert!(label.ends_with(SNAPSHOT_LABEL_SUFFIX));
        assert!(session.snapshots().snapshot_dir(&label).join("src.ts").exists());
    }

    #[tokio::test]
    async fn envelope_parse_error_aborts_without_touching_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let before = fs::read_to_string(session.workspace_root().join("src.ts")).unwrap();

        let output = "<changes><change><file>x</file><content>unterminated...";
        let (tx, mut rx) = mpsc::channel(16);
        let result = session.apply_model_output(output, None, &tx).await;

        assert!(result.is_err());
        assert_eq!(
            fs::read_to_string(session.workspace_root().join("src.ts")).unwrap(),
            before
        );
        assert!(session.snapshots().latest_label().is_none());

        let events = drain(&mut rx).await;
        assert!(matches!(&events[..], [SessionEvent::Error(_)]));
    }

    #[tokio::test]
    async fn skipped_edits_do_not_trigger_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        fs::write(session.workspace_root().join("log.ts"), "console.log(\"old\");\n").unwrap();

        let output = r#"<changes>
  <file_update>
    <file>log.ts</file>
    <operations>
      <block>
        <path><![CDATA[$line:1:console.log("different")]]></path>
        <content><![CDATA[console.log("new");]]></content>
      </block>
    </operations>
  </file_update>
</changes>"#;

        let (tx, mut rx) = mpsc::channel(16);
        let report = session.apply_model_output(output, None, &tx).await.unwrap();

        assert_eq!(report.skipped, vec!["log.ts"]);
        assert!(!report.any_applied());
        assert!(session.snapshots().latest_label().is_none());
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn initial_snapshot_elides_after_post_apply_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());

        let output = r#"<changes><change type="update"><file>src.ts</file><content><![CDATA[const rewritten = true;
]]></content></change></changes>"#;
        let (tx, _rx) = mpsc::channel(16);
        session.apply_model_output(output, None, &tx).await.unwrap();

        // Nothing changed since the forced post-apply snapshot.
        assert!(!session.snapshot_initial_state().unwrap());
    }
}
