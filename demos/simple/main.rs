use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use serde::Deserialize;
use switch_sdk::{
    Client, ClientConfig, Context, Engine, FactorError, FactorRegistry, Result, Session,
    ShutdownSignal, UpdateSink, UpdateSource,
};

const ENV: &str = "pre";

#[derive(Deserialize)]
struct UserNameConfig {
    names: Vec<String>,
}

#[derive(Deserialize)]
struct SingleConfig {
    enabled: bool,
}

/// Plays the part of a transport: publishes a new `feature_enabled` ruleset every few seconds.
#[derive(Default)]
struct ScriptedSource {
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateSource for ScriptedSource {
    fn start(
        &self,
        sink: UpdateSink,
        config: &ClientConfig,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        let strategy = config.reconnect_strategy.clone();
        let handle = std::thread::Builder::new()
            .name("switch-updates".to_owned())
            .spawn(move || {
                let mut version = 0;
                loop {
                    version += 1;
                    let enabled = version % 2 == 1;
                    let payload = serde_json::json!({
                        "name": "feature_enabled",
                        "version": version,
                        "useCache": true,
                        "rules": {
                            "nodeType": "AND",
                            "children": [
                                {"factor": "user_name", "config": {"names": ["alice", "bob"]}},
                                {"factor": "single", "config": {"enabled": enabled}}
                            ]
                        }
                    });
                    sink.apply_json(payload.to_string().as_bytes());

                    if shutdown.wait_timeout(strategy.delay_for_attempt(1)) {
                        return;
                    }
                }
            })?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let factors = FactorRegistry::new();
    factors
        .register(
            "user_name",
            "open for the listed user names",
            |ctx: &Context, config: UserNameConfig| {
                let name = ctx
                    .get("user_name")
                    .and_then(|value| value.as_str())
                    .ok_or_else(|| FactorError::failed("user_name attribute is missing"))?;
                Ok(config.names.iter().any(|n| n == name))
            },
        )
        .unwrap();
    factors
        .register(
            "single",
            "a plain on/off switch",
            |_: &Context, config: SingleConfig| Ok(config.enabled),
        )
        .unwrap();

    let mut config = ClientConfig::new();
    config
        .domain("ws://localhost:8081")
        .namespace_tag("test-ns")
        .env_tag(ENV)
        .service_name("simple-demo")
        .version("1.0.0");

    let client = Client::new(config, Engine::new(Arc::new(factors)))
        .with_update_source(ScriptedSource::default());
    client.start().expect("failed to initialize switch client");

    // One cache for the whole demo, as a long-lived service would keep it.
    let ctx = Context::new().use_cache().with_attribute("user_name", "alice");

    for i in 0..5 {
        let session = Session::with_request_id(format!("demo-{i}"));
        let state = if client.is_open_with_session(&ctx, &session, "feature_enabled") {
            "ON"
        } else {
            "OFF"
        };
        println!(
            "Env '{ENV}' Switch 'feature_enabled' is {state} (factors: {:?})",
            session
                .records()
                .iter()
                .map(|record| (&record.name, record.stats.result))
                .collect::<Vec<_>>()
        );
        std::thread::sleep(Duration::from_secs(3));
    }

    client.shutdown();
}
