//! Operator demo binary: wires the engine to an in-memory Telegram double
//! and the real JSON-file/on-disk platform adapters, runs one export task
//! end to end, and renders its progress with `indicatif`.
//!
//! There's no real MTProto session here — that lives outside this
//! workspace (spec §6) — so this binary exists to prove the engine, the
//! concrete `TaskStore`, and the directory-layout adapter all fit together,
//! the way an operator would actually run them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use engine::model::{ChatInfo, ChatType, ExportOptions, MediaDescriptor, MediaType, MessageInfo, TaskStatus};
use engine::mtproto::MockMtProtoClient;
use engine::notify::TaskObserver;
use engine::task_manager::EngineState;
use indicatif::{ProgressBar, ProgressStyle};
use storage::JsonFileStore;
use tracing::info;

const DEMO_CHAT_ID: i64 = -1001234567890;

struct DemoObserver {
    bar: ProgressBar,
}

impl TaskObserver for DemoObserver {
    fn on_task_changed(&self, task: &engine::model::Task) {
        self.bar.set_length(task.total_media.max(1));
        self.bar.set_position(task.downloaded_media);
        self.bar.set_message(format!("{:?}", task.status));
    }
}

fn demo_client() -> MockMtProtoClient {
    let chat = ChatInfo {
        id: DEMO_CHAT_ID,
        title: "Demo Export Channel".to_string(),
        chat_type: ChatType::Channel,
        username: None,
        members_count: Some(42),
    };

    let mut messages = Vec::new();
    for i in 1..=6 {
        let file_ref = format!("file-{i}");
        messages.push(MessageInfo {
            id: i,
            chat_id: DEMO_CHAT_ID,
            date: chrono::Utc::now(),
            from_user_id: None,
            text: None,
            media: Some(MediaDescriptor {
                media_type: MediaType::Photo,
                file_size: 2048,
                original_name: Some(format!("photo_{i}.jpg")),
                file_reference: file_ref,
            }),
        });
    }

    let mut client = MockMtProtoClient::new(vec![chat]).with_history(DEMO_CHAT_ID, messages);
    for i in 1..=6 {
        client = client.with_file_body(&format!("file-{i}"), vec![0xAB; 2048]);
    }
    client
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let data_dir = platform::layout::data_dir().join("demo-run");
    info!(path = %data_dir.display(), "using demo data directory");
    platform::layout::prepare_export_layout(&data_dir, &data_dir.join("temp")).await?;

    let store = JsonFileStore::new(data_dir.join("tasks.json"));
    let bar = ProgressBar::new(1);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} media ({msg})")?
            .progress_chars("#>-"),
    );
    let observer = Arc::new(DemoObserver { bar: bar.clone() });

    let client: Arc<dyn engine::mtproto::MtProtoClient> = Arc::new(demo_client());
    let state = Arc::new(EngineState::new(client, store.clone(), observer, None, data_dir));
    store.attach(&state);

    let options = ExportOptions {
        public_channels: true,
        export_path: "/tmp/tg-export-demo".to_string(),
        ..Default::default()
    };
    let task = state.create("Demo Export".to_string(), options).await?;
    info!(task_id = %task.id, "created demo task");
    state.start(&task.id).await?;

    loop {
        let snapshot = state.snapshot(&task.id).await?;
        if matches!(snapshot.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled) {
            bar.finish_with_message(format!("{:?}", snapshot.status));
            info!(
                downloaded = snapshot.downloaded_media,
                total = snapshot.total_media,
                bytes = snapshot.downloaded_size,
                "demo export finished"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Ok(())
}
