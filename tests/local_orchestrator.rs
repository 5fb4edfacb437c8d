//! End-to-end runs of the in-process orchestrator.
//!
//! HTTP sources are served by a local mockito server; nothing leaves the
//! machine.

mod common;

use common::SlowEngineFactory;
use edgequake_jobkit::engine::text::TextEngineFactory;
use edgequake_jobkit::{
    ConnectorContext, ConvertOptions, ConverterManagerConfig, DocumentError, DocumentStatus,
    EngineFactory, LocalOrchestrator, LocalOrchestratorConfig, Orchestrator, OutputFormat,
    ResultKind, TaskId, TaskResult, TaskSource, TaskStatus, TaskTarget,
};
use std::sync::Arc;
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn orchestrator(num_workers: usize) -> LocalOrchestrator {
    orchestrator_with(num_workers, Arc::new(TextEngineFactory::new()))
}

fn orchestrator_with(num_workers: usize, factory: Arc<dyn EngineFactory>) -> LocalOrchestrator {
    LocalOrchestrator::new(
        LocalOrchestratorConfig {
            num_workers,
            shared_models: true,
        },
        ConverterManagerConfig::default(),
        factory,
        ConnectorContext::default(),
    )
    .unwrap()
}

fn md(name: &str, body: &str) -> TaskSource {
    TaskSource::File {
        content: body.as_bytes().to_vec(),
        filename: name.into(),
    }
}

fn start(orch: &LocalOrchestrator) -> tokio::task::JoinHandle<()> {
    let runner = orch.clone();
    tokio::spawn(async move {
        runner.process_queue().await.unwrap();
    })
}

/// Poll until the task is terminal, then fetch its result.
async fn wait_for_result(orch: &LocalOrchestrator, task_id: &TaskId) -> Arc<TaskResult> {
    for _ in 0..50 {
        let task = orch
            .task_status(task_id, Duration::from_millis(200))
            .await
            .unwrap();
        if task.status.is_terminal() {
            return orch
                .task_result(task_id)
                .await
                .unwrap()
                .expect("terminal task has a result");
        }
    }
    panic!("task {task_id} did not finish");
}

fn http(url: String) -> TaskSource {
    TaskSource::Http {
        url,
        headers: Default::default(),
    }
}

// ── HTTP source, in-body target ──────────────────────────────────────────────

#[tokio::test]
async fn http_source_in_body_export() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/notes.md")
        .with_status(200)
        .with_header("content-type", "text/markdown")
        .with_body("# Release notes\n\nEverything works.\n")
        .create_async()
        .await;

    let orch = orchestrator(2);
    let workers = start(&orch);
    let options = ConvertOptions::builder()
        .to_formats([OutputFormat::Md, OutputFormat::Text])
        .build()
        .unwrap();
    let task = orch
        .enqueue(vec![http(format!("{}/notes.md", server.url()))], options, TaskTarget::InBody)
        .await
        .unwrap();

    let result = wait_for_result(&orch, &task.task_id).await;
    mock.assert_async().await;

    let ResultKind::Export { documents } = &result.result else {
        panic!("expected an export result, got {:?}", result.result);
    };
    assert_eq!(documents.len(), 1);
    let doc = &documents[0];
    assert_eq!(doc.outcome.filename, "notes.md");
    assert_eq!(doc.outcome.status, DocumentStatus::Success);
    assert!(doc.content.md_content.as_deref().unwrap().contains("# Release notes"));
    assert!(doc.content.text_content.as_deref().unwrap().contains("Everything works."));
    assert!(doc.content.html_content.is_none());
    assert_eq!(
        orch.task_status(&task.task_id, Duration::ZERO).await.unwrap().status,
        TaskStatus::Success
    );
    workers.abort();
}

#[tokio::test]
async fn failed_download_is_a_document_failure() {
    let mut server = mockito::Server::new_async().await;
    let _missing = server
        .mock("GET", "/gone.md")
        .with_status(404)
        .create_async()
        .await;
    let _ok = server
        .mock("GET", "/ok.md")
        .with_status(200)
        .with_body("fine")
        .create_async()
        .await;

    let orch = orchestrator(1);
    let workers = start(&orch);
    let task = orch
        .enqueue(
            vec![
                http(format!("{}/gone.md", server.url())),
                http(format!("{}/ok.md", server.url())),
            ],
            ConvertOptions::default(),
            TaskTarget::InBody,
        )
        .await
        .unwrap();

    let result = wait_for_result(&orch, &task.task_id).await;
    assert!(!result.is_task_failure());
    assert_eq!(result.num_failed, 1);
    assert_eq!(result.num_succeeded, 1);

    let docs = result.documents();
    assert_eq!(docs[0].status, DocumentStatus::Failure);
    assert!(matches!(docs[0].errors[0], DocumentError::FetchFailed { .. }));
    assert_eq!(docs[1].status, DocumentStatus::Success);
    workers.abort();
}

// ── Queue positions ──────────────────────────────────────────────────────────

#[tokio::test]
async fn queue_position_never_increases() {
    let orch = orchestrator(1);
    let mut ids = Vec::new();
    for i in 0..4 {
        let task = orch
            .enqueue(
                vec![TaskSource::File {
                    content: format!("# Doc {i}\n\ntext").into_bytes(),
                    filename: format!("doc{i}.md"),
                }],
                ConvertOptions::default(),
                TaskTarget::InBody,
            )
            .await
            .unwrap();
        ids.push(task.task_id);
    }
    let last = ids[3];
    assert_eq!(orch.get_queue_position(&last).await, Some(4));

    let workers = start(&orch);
    let mut seen = vec![4];
    for _ in 0..500 {
        match orch.get_queue_position(&last).await {
            Some(pos) => seen.push(pos),
            None => break,
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(seen.windows(2).all(|w| w[1] <= w[0]), "positions: {seen:?}");

    let result = wait_for_result(&orch, &last).await;
    assert_eq!(result.num_succeeded, 1);
    assert_eq!(orch.get_queue_position(&last).await, None);
    for id in &ids {
        assert!(orch
            .task_status(id, Duration::ZERO)
            .await
            .unwrap()
            .status
            .is_terminal());
    }
    assert_eq!(orch.queue_size().await.unwrap(), 0);
    workers.abort();
}

// ── Local path target ────────────────────────────────────────────────────────

#[tokio::test]
async fn local_directory_in_local_directory_out() {
    let input = tempfile::tempdir().unwrap();
    std::fs::write(input.path().join("a.md"), "# A\n\nalpha").unwrap();
    std::fs::write(input.path().join("b.txt"), "bravo").unwrap();
    std::fs::write(input.path().join("skip.bin"), [0u8, 1, 2]).unwrap();
    let output = tempfile::tempdir().unwrap();

    let orch = orchestrator(1);
    let workers = start(&orch);
    let options = ConvertOptions::builder()
        .to_formats([OutputFormat::Md, OutputFormat::Json])
        .build()
        .unwrap();
    let task = orch
        .enqueue(
            vec![TaskSource::LocalPath {
                path: input.path().to_path_buf(),
                pattern: "[ab].*".into(),
                recursive: false,
            }],
            options,
            TaskTarget::LocalPath {
                path: output.path().to_path_buf(),
            },
        )
        .await
        .unwrap();

    let result = wait_for_result(&orch, &task.task_id).await;
    assert!(matches!(result.result, ResultKind::RemoteTarget { .. }));
    assert_eq!(result.num_succeeded, 2);
    assert!(output.path().join("md/a.md").is_file());
    assert!(output.path().join("json/b.json").is_file());
    workers.abort();
}

// ── Worker pool ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn at_most_num_workers_tasks_run_at_once() {
    let factory = SlowEngineFactory::new(Duration::from_millis(150));
    let gauge = factory.gauge();
    let orch = orchestrator_with(2, Arc::new(factory));
    let workers = start(&orch);

    let mut ids = Vec::new();
    for i in 0..6 {
        let task = orch
            .enqueue(
                vec![md(&format!("d{i}.md"), "# Doc")],
                ConvertOptions::default(),
                TaskTarget::InBody,
            )
            .await
            .unwrap();
        ids.push(task.task_id);
    }
    for id in &ids {
        assert_eq!(wait_for_result(&orch, id).await.num_succeeded, 1);
    }
    assert_eq!(gauge.finished(), 6);
    assert_eq!(gauge.peak(), 2);
    workers.abort();
}

#[tokio::test]
async fn running_task_finishes_after_workers_are_cancelled() {
    let factory = SlowEngineFactory::new(Duration::from_millis(400));
    let orch = orchestrator_with(1, Arc::new(factory));
    let workers = start(&orch);
    let task = orch
        .enqueue(vec![md("slow.md", "# Slow")], ConvertOptions::default(), TaskTarget::InBody)
        .await
        .unwrap();

    let seen = orch
        .task_status(&task.task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(seen.status, TaskStatus::Started);
    workers.abort();
    assert!(workers.await.unwrap_err().is_cancelled());

    let result = wait_for_result(&orch, &task.task_id).await;
    assert_eq!(result.num_succeeded, 1);
    assert_eq!(
        orch.task_status(&task.task_id, Duration::ZERO).await.unwrap().status,
        TaskStatus::Success
    );
    assert_eq!(orch.get_queue_position(&task.task_id).await, None);
}

#[tokio::test]
async fn workers_restart_after_cancel() {
    let orch = orchestrator(1);
    let first = start(&orch);
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    let second = start(&orch);
    let task = orch
        .enqueue(vec![md("a.md", "# A")], ConvertOptions::default(), TaskTarget::InBody)
        .await
        .unwrap();
    assert_eq!(wait_for_result(&orch, &task.task_id).await.num_succeeded, 1);
    assert!(!second.is_finished());
    second.abort();
}

// ── Zip target ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn zip_target_with_several_documents() {
    let orch = orchestrator(1);
    let workers = start(&orch);
    let options = ConvertOptions::builder()
        .to_formats([OutputFormat::Md, OutputFormat::Json])
        .build()
        .unwrap();
    let task = orch
        .enqueue(
            vec![
                md("intro.md", "# Intro"),
                md("report.md", "# Report"),
                md("report.txt", "plain report"),
                md("broken.pdf", "%PDF-1.7"),
            ],
            options,
            TaskTarget::Zip,
        )
        .await
        .unwrap();

    let result = wait_for_result(&orch, &task.task_id).await;
    assert!(!result.is_task_failure());
    let ResultKind::Zip { content, documents } = &result.result else {
        panic!("expected a zip result, got {:?}", result.result);
    };
    let statuses: Vec<DocumentStatus> = documents.iter().map(|d| d.status).collect();
    assert_eq!(
        statuses,
        [
            DocumentStatus::Success,
            DocumentStatus::Success,
            DocumentStatus::Success,
            DocumentStatus::Failure
        ]
    );
    assert_eq!((result.num_succeeded, result.num_failed), (3, 1));

    let archive = zip::ZipArchive::new(std::io::Cursor::new(content.clone())).unwrap();
    let mut names: Vec<&str> = archive.file_names().collect();
    names.sort_unstable();
    assert_eq!(
        names,
        [
            "json/intro.json",
            "json/report.json",
            "json/report_1.json",
            "md/intro.md",
            "md/report.md",
            "md/report_1.md",
        ]
    );
    workers.abort();
}
