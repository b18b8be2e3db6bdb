mod common;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use common::{TestServer, collect, open_call, program, run, shell};
use runner_proto::runner::v1 as pb;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Code;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_run_in_order() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let out = run(&mut client, shell(&["echo a", "echo b"])).await?;
    assert_eq!(out.stdout_str(), "a\nb\n");
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stops_after_first_failing_command() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let out = run(&mut client, shell(&["exit 3", "echo unreachable"])).await?;
    assert!(!out.stdout_str().contains("unreachable"));
    assert_eq!(out.exit_codes, vec![3]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_is_kept_separate() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let req = pb::ExecuteRequest {
        program_name: "/bin/sh".to_string(),
        script: "echo out; echo err >&2; exit 2".to_string(),
        ..Default::default()
    };
    let out = run(&mut client, req).await?;
    assert_eq!(out.stdout_str(), "out\n");
    assert_eq!(out.stderr_str(), "err\n");
    assert_eq!(out.exit_codes, vec![2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_input_reaches_stdin_then_closes_it() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut req = program("cat", &[]);
    req.input_data = b"hello stdin".to_vec();
    let out = run(&mut client, req).await?;
    assert_eq!(out.stdout_str(), "hello stdin");
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn working_directory_is_honored() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;
    let dir = tempfile::tempdir()?;

    let mut req = program("pwd", &[]);
    req.directory = dir.path().display().to_string();
    let out = run(&mut client, req).await?;
    assert_eq!(
        std::fs::canonicalize(out.stdout_str().trim())?,
        std::fs::canonicalize(dir.path())?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_stop_reports_sentinel_exit_code() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut call = open_call(&mut client, program("sleep", &["30"])).await?;
    call.requests
        .send(pb::ExecuteRequest {
            stop: pb::ExecuteStop::Kill as i32,
            ..Default::default()
        })
        .await?;

    let out = tokio::time::timeout(Duration::from_secs(10), collect(&mut call.responses))
        .await
        .expect("killed call should finish")?;
    assert_eq!(out.exit_codes, vec![-1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_stop_reports_sentinel_exit_code() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut call = open_call(&mut client, program("sleep", &["30"])).await?;
    call.requests
        .send(pb::ExecuteRequest {
            stop: pb::ExecuteStop::Interrupt as i32,
            ..Default::default()
        })
        .await?;

    let out = tokio::time::timeout(Duration::from_secs(10), collect(&mut call.responses))
        .await
        .expect("interrupted call should finish")?;
    assert_eq!(out.exit_codes, vec![-1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_stop_value_is_ignored() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut call = open_call(&mut client, shell(&["sleep 0.3", "echo finished"])).await?;
    call.requests
        .send(pb::ExecuteRequest {
            stop: 42,
            ..Default::default()
        })
        .await?;

    let out = tokio::time::timeout(Duration::from_secs(10), collect(&mut call.responses))
        .await
        .expect("call should finish")?;
    assert_eq!(out.stdout_str(), "finished\n");
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tty_output_is_streamed() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut req = program("sh", &["-c", "echo from-tty"]);
    req.tty = true;
    let out = run(&mut client, req).await?;
    assert!(out.stdout_str().contains("from-tty"), "got {:?}", out.stdout_str());
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_request_stream_is_a_no_op() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<pb::ExecuteRequest>(1);
    drop(tx);
    let mut responses = client.execute(ReceiverStream::new(rx)).await?.into_inner();
    let out = collect(&mut responses).await?;
    assert!(out.stdout.is_empty());
    assert!(out.exit_codes.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failure_ends_the_call_with_error() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let err = run(&mut client, program("/nonexistent/runner-test-binary", &[]))
        .await
        .expect_err("spawn must fail");
    assert_eq!(err.code(), Code::FailedPrecondition);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_requests_are_rejected() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut both = shell(&["true"]);
    both.script = "true".to_string();
    let err = run(&mut client, both).await.expect_err("ambiguous request");
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = run(&mut client, pb::ExecuteRequest::default())
        .await
        .expect_err("empty request");
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_after_exit_is_benign() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut call = open_call(&mut client, program("true", &[])).await?;
    let mut exit_codes = Vec::new();
    while let Some(resp) = call.responses.next().await {
        if let Some(code) = resp?.exit_code {
            exit_codes.push(code);
            break;
        }
    }
    assert_eq!(exit_codes, vec![0]);
    drop(call);

    // The server keeps serving after the cancelled call.
    let out = run(&mut client, shell(&["echo still-alive"])).await?;
    assert_eq!(out.stdout_str(), "still-alive\n");
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_call_kills_the_process() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let req = pb::ExecuteRequest {
        program_name: "/bin/sh".to_string(),
        script: "echo $$; exec sleep 30".to_string(),
        ..Default::default()
    };
    let mut call = open_call(&mut client, req).await?;

    let mut stdout = Vec::new();
    while !stdout.contains(&b'\n') {
        let resp = call
            .responses
            .next()
            .await
            .expect("pid line before end of stream")?;
        stdout.extend_from_slice(&resp.stdout_data);
    }
    let pid: u32 = String::from_utf8(stdout)?.trim().parse()?;
    let proc_dir = format!("/proc/{pid}");
    assert!(Path::new(&proc_dir).exists());

    drop(call);

    let gone = tokio::time::timeout(Duration::from_secs(10), async {
        while Path::new(&proc_dir).exists() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "process {pid} survived the cancelled call");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_output_arrives_intact() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    // Larger than a ring, so the producer has to wait on the client.
    let out = run(&mut client, shell(&["head -c 300000 /dev/zero"])).await?;
    assert_eq!(out.stdout.len(), 300_000);
    assert!(out.stdout.iter().all(|b| *b == 0));
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_reaches_a_process_that_never_reads_its_input() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    // Far more than a pipe holds, so the stdin write cannot complete.
    let mut req = program("sleep", &["30"]);
    req.input_data = vec![b'x'; 512 << 10];
    let mut call = open_call(&mut client, req).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    call.requests
        .send(pb::ExecuteRequest {
            stop: pb::ExecuteStop::Kill as i32,
            ..Default::default()
        })
        .await?;

    let out = tokio::time::timeout(Duration::from_secs(5), collect(&mut call.responses))
        .await
        .expect("kill should not wait on stdin")?;
    assert_eq!(out.exit_codes, vec![-1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tty_input_from_later_requests_reaches_the_process() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut req = program("head", &["-n1"]);
    req.tty = true;
    let mut call = open_call(&mut client, req).await?;
    call.requests
        .send(pb::ExecuteRequest {
            input_data: b"hello-line\n".to_vec(),
            ..Default::default()
        })
        .await?;

    let out = tokio::time::timeout(Duration::from_secs(10), collect(&mut call.responses))
        .await
        .expect("head should exit after one line")?;
    // Echo is off, so the line shows up once, with the terminal's line ending.
    assert_eq!(out.stdout_str(), "hello-line\r\n");
    assert_eq!(out.exit_codes, vec![0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn receive_error_kills_the_process_and_fails_the_call() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.client().await?;

    let mut call = open_call(&mut client, program("sleep", &["30"])).await?;
    // Over the server's 4 MiB message limit, so decoding it fails.
    call.requests
        .send(pb::ExecuteRequest {
            input_data: vec![b'x'; 5 << 20],
            ..Default::default()
        })
        .await?;

    let err = tokio::time::timeout(Duration::from_secs(10), collect(&mut call.responses))
        .await
        .expect("call should end once the process is killed")
        .expect_err("receive error is reported");
    assert_eq!(err.code(), Code::OutOfRange);
    Ok(())
}
