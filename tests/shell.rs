mod common;

use common::{eventually, ready_connection, with_timeout, ServerSettings, TIMEOUT};
use futures::StreamExt;
use sshmux::{ShellError, ShellState};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn written_data_comes_back() -> anyhow::Result<()> {
    let (_transport, connection) = ready_connection(ServerSettings::default()).await;
    let mut shell = with_timeout(connection.request_shell(TIMEOUT)).await?;
    assert_eq!(shell.state(), ShellState::Ready);

    let mut reader = shell.take_reader().expect("reader already taken");
    assert!(shell.take_reader().is_none());

    shell.write(&b"ls\n"[..]).await?;
    let echoed = with_timeout(reader.next()).await.expect("reader ended");
    assert_eq!(&echoed[..], b"ls\n");

    shell.close().await?;
    assert_eq!(shell.state(), ShellState::Closed);
    assert_eq!(with_timeout(reader.next()).await, None);
    Ok(())
}

#[tokio::test]
async fn output_without_a_reader_is_not_kept() -> anyhow::Result<()> {
    let (_transport, connection) = ready_connection(ServerSettings::default()).await;
    let mut shell = with_timeout(connection.request_shell(TIMEOUT)).await?;

    // echoed back while nobody is reading
    shell.write("unread\n").await?;
    shell.write("exit\n").await?;
    eventually(|| shell.state() == ShellState::Failed(ShellError::Unknown)).await;

    let mut reader = shell.take_reader().expect("reader already taken");
    assert_eq!(with_timeout(reader.next()).await, None);
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> anyhow::Result<()> {
    let (_transport, connection) = ready_connection(ServerSettings::default()).await;
    let shell = with_timeout(connection.request_shell(TIMEOUT)).await?;

    let (a, b) = tokio::join!(shell.close(), shell.close());
    a?;
    b?;
    with_timeout(shell.close()).await?;
    assert_eq!(shell.state(), ShellState::Closed);

    let err = shell.write("late").await.unwrap_err();
    assert_eq!(err, ShellError::RequireConnection);
    Ok(())
}

#[tokio::test]
async fn remote_close_is_a_failure() -> anyhow::Result<()> {
    let (_transport, connection) = ready_connection(ServerSettings::default()).await;
    let shell = with_timeout(connection.request_shell(TIMEOUT)).await?;

    shell.write("exit\n").await?;
    eventually(|| shell.state() == ShellState::Failed(ShellError::Unknown)).await;

    assert_eq!(shell.write("echo").await, Err(ShellError::Unknown));
    // closing an ended shell still succeeds
    shell.close().await?;
    Ok(())
}

#[tokio::test]
async fn observers_follow_the_close() -> anyhow::Result<()> {
    let (_transport, connection) = ready_connection(ServerSettings::default()).await;
    let shell = with_timeout(connection.request_shell(TIMEOUT)).await?;

    let seen = Arc::new(Mutex::new(vec![]));
    shell
        .add_state_observer({
            let seen = seen.clone();
            move |state| seen.lock().unwrap().push(state.clone())
        })
        .await?;

    shell.close().await?;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ShellState::Closing, ShellState::Closed]
    );
    Ok(())
}
