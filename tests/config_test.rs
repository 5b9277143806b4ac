use leaseq::config::{Config, QueueOptions, TransportKind};

// Environment variables are process-global, so every case lives in one test.
#[test]
fn config_from_env_follows_the_selected_transport() {
    unsafe {
        std::env::set_var("LEASEQ_TRANSPORT", "redis");
        std::env::set_var("REDIS_URL", "redis://localhost:6379");
        std::env::set_var("LEASEQ_QUEUE", "orders");
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("LEASEQ_OPTIONS");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.transport, TransportKind::Redis);
    assert_eq!(config.queue, "orders");
    assert!(config.database_url.is_none());
    assert!(!config.log_level.is_empty());
    let options = config.queue_options().unwrap();
    assert!(options.enable_heartbeat);

    // Postgres needs DATABASE_URL.
    unsafe {
        std::env::set_var("LEASEQ_TRANSPORT", "postgres");
    }
    assert!(Config::from_env().is_err());

    // Queue names must be valid.
    unsafe {
        std::env::set_var("LEASEQ_TRANSPORT", "memory");
        std::env::set_var("LEASEQ_QUEUE", "bad_name");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("LEASEQ_TRANSPORT", "carrier-pigeon");
        std::env::set_var("LEASEQ_QUEUE", "orders");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        for var in ["LEASEQ_TRANSPORT", "REDIS_URL", "LEASEQ_QUEUE"] {
            std::env::remove_var(var);
        }
    }
}

#[test]
fn queue_options_load_from_toml() {
    let options = QueueOptions::from_toml_str(
        r#"
        enable_routes = true
        routes = ["eu", "us"]
        id_strategy = "uuid"

        [heartbeat]
        interval_ms = 5000
        window_ms = 20000

        [retry.default]
        delays_ms = [100, 200]

        [retry.exceptions.Fatal]
        delays_ms = []
        "#,
    )
    .unwrap();
    assert_eq!(options.routes, ["eu", "us"]);
    assert_eq!(options.heartbeat.window_ms, 20000);
    assert_eq!(options.retry.default.max_retries(), 2);
    assert_eq!(options.retry.exceptions["Fatal"].max_retries(), 0);
    options.validate(TransportKind::Redis).unwrap();
    assert!(options.validate(TransportKind::Postgres).is_err());
}

#[test]
fn unknown_option_keys_are_rejected() {
    assert!(QueueOptions::from_toml_str("enable_prioritee = true").is_err());
}
