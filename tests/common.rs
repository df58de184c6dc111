use hostwork::remote::RemoteOptions;

pub fn test_host() -> String {
    std::env::var("TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn test_port() -> u16 {
    std::env::var("TEST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(2222)
}

pub fn base_opts() -> RemoteOptions {
    RemoteOptions {
        user: Some("test-user".to_string()),
        host_string: Some(test_host()),
        port: Some(test_port()),
        ..Default::default()
    }
}
