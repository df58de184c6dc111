mod common;

use hostwork::remote::{remote, remote_file_exists, remote_sudo, RemoteOptions};

// These exercise a real `ssh` connection and are only meaningful against the
// docker-compose test host the teacher's own suite expects (`TEST_HOST`/`TEST_PORT`),
// so they're ignored unless explicitly enabled.

#[tokio::test]
#[ignore]
async fn remote_echoes_stdout_and_stderr_separately() {
    let mut opts = common::base_opts();
    opts.combine_stderr = Some(false);
    let result = remote(
        r#"echo "printed to standard out"; >&2 echo "printed to standard error""#,
        opts,
    )
    .await
    .unwrap();

    assert_eq!(result.stdout, vec!["printed to standard out".to_string()]);
    assert_eq!(result.stderr, vec!["printed to standard error".to_string()]);
}

#[tokio::test]
#[ignore]
async fn remote_nonzero_exit_is_command_failed() {
    let opts = common::base_opts();
    let err = remote("exit 123", opts).await.unwrap_err();
    match err {
        hostwork::Error::CommandFailed(result) => {
            assert_eq!(result.return_code, 123);
            assert!(result.failed());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn remote_sudo_runs_as_root() {
    let opts = common::base_opts();
    let result = remote_sudo("whoami", opts).await.unwrap();
    assert_eq!(result.stdout, vec!["root".to_string()]);
}

#[tokio::test]
#[ignore]
async fn remote_file_exists_detects_missing_file() {
    let opts = common::base_opts();
    assert!(!remote_file_exists("/no/such/path", opts).await.unwrap());
}
