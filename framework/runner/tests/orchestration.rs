mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_for_content, MockTransport, Workspace};
use pretty_assertions::assert_eq;
use swarm_core::prelude::{InterruptHandle, Role, RunPlan, SwarmError, LOOPBACK};
use swarm_runner::prelude::{Coordinator, FleetCommand, FleetDispatcher, RunState, REMOTE_STAGING_DIR};

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|h| h.to_string()).collect()
}

fn load_plan(role: Role, ws: &Workspace) -> RunPlan {
    RunPlan::new(role, ws.locustfile(), ws.config_file())
        .run_time("10s")
        .users(10)
        .spawn_rate(5)
        .csv_prefix("results")
        .params(ws.params())
        .output_dir(ws.output_dir())
        .no_progress(true)
}

#[tokio::test]
async fn run_workers_on_loopback_spawns_local_workers() {
    let ws = Workspace::new();
    let locust = ws.fake_locust(0);
    let config = ws.config(&locust, 15601);
    let plan = load_plan(Role::RunWorkers, &ws)
        .workers(4)
        .master_host(LOOPBACK)
        .drivers([LOOPBACK]);
    let transport = Arc::new(MockTransport::default());

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new());
    coordinator.execute().await.expect("run_workers failed");

    // Nothing goes through the remote transport for the loopback driver.
    assert_eq!(transport.call_count(), 0);
    assert_eq!(coordinator.local_workers().len(), 4);
    assert!(coordinator
        .local_workers()
        .iter()
        .all(|w| w.command().starts_with("nohup ")));

    for i in 0..4 {
        let out = ws.output_dir().join(format!("worker{i}.out"));
        assert!(
            wait_for_content(&out, "--worker --master-port 15601").await,
            "missing output for worker {i}"
        );
    }
    assert!(!ws.output_dir().join("worker4.out").exists());
    assert_eq!(coordinator.state(), RunState::Completed);
}

#[tokio::test]
async fn configure_stops_at_first_failing_command() {
    let ws = Workspace::new();
    let mut config = ws.config(&ws.fake_locust(0), 15602);
    config.configure_commands = vec![
        "echo first".to_string(),
        "echo second".to_string(),
        "echo third".to_string(),
    ];
    let plan = RunPlan::new(Role::Configure, ws.locustfile(), ws.config_file())
        .drivers(["h1", "h2", "h3"]);
    let transport = Arc::new(MockTransport::default().failing("h2", "second", 1));

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new());
    let err = coordinator.execute().await.unwrap_err();

    assert!(err.already_reported());
    assert_eq!(err.exit_code(), 1);
    assert!(matches!(
        err.cause(),
        SwarmError::Command { host: Some(host), exit_code: Some(1), .. } if host == "h2"
    ));

    let mut first = transport.hosts_running("first");
    first.sort();
    assert_eq!(first, hosts(&["h1", "h2", "h3"]));
    // Every host ran the failing command, the fleet is always joined.
    assert_eq!(transport.hosts_running("second").len(), 3);
    assert!(transport.hosts_running("third").is_empty());
    assert_eq!(
        coordinator.visited_states(),
        &[RunState::Idle, RunState::Provisioning, RunState::Failed]
    );
}

#[tokio::test]
async fn configure_on_loopback_runs_locally() {
    let ws = Workspace::new();
    let marker = ws.path().join("configured");
    let mut config = ws.config(&ws.fake_locust(0), 15603);
    config.configure_commands = vec![format!("touch {}", marker.display())];
    let plan = RunPlan::new(Role::Configure, ws.locustfile(), ws.config_file()).drivers([LOOPBACK]);
    let transport = Arc::new(MockTransport::default());

    Coordinator::new(plan, config, transport.clone(), InterruptHandle::new())
        .execute()
        .await
        .expect("configure failed");

    assert!(marker.exists());
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn failed_master_still_kills_remote_workers() {
    let ws = Workspace::new();
    let config = ws.config(&ws.fake_locust(3), 15604);
    let plan = load_plan(Role::RunMaster, &ws)
        .workers(2)
        .drivers(["h1", "h2"]);
    let transport = Arc::new(MockTransport::default());

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new());
    let err = coordinator.execute().await.unwrap_err();

    assert!(matches!(
        err.cause(),
        SwarmError::Command {
            exit_code: Some(3),
            host: None,
            ..
        }
    ));
    assert!(err.already_reported());
    assert_eq!(err.stage(), "running the master");

    let mut killed = transport.hosts_running("pkill -9 -f '[w]orker --master-port 15604'");
    killed.sort();
    assert_eq!(killed, hosts(&["h1", "h2"]));
    assert_eq!(transport.execs().len(), 2);
    assert_eq!(
        coordinator.visited_states(),
        &[
            RunState::Idle,
            RunState::RunningMaster,
            RunState::CleaningUp,
            RunState::Failed
        ]
    );
}

#[tokio::test]
async fn run_across_two_drivers() {
    let ws = Workspace::new();
    let mut config = ws.config(&ws.fake_locust(0), 15605);
    config.distribute_workload_directory = true;
    let plan = load_plan(Role::Run, &ws)
        .workers(2)
        .master_host("10.0.0.1")
        .drivers(["h1", "h2"]);
    let transport = Arc::new(MockTransport::default());

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new());
    coordinator.execute().await.expect("run failed");

    // The workload directory, params and config land in the staging directory of both drivers.
    let copies = transport.copies();
    assert_eq!(copies.len(), 6);
    for host in ["h1", "h2"] {
        let to_host: Vec<_> = copies.iter().filter(|(h, _, _)| h == host).collect();
        assert_eq!(to_host.len(), 3);
        assert!(to_host.iter().all(|(_, _, dir)| dir == REMOTE_STAGING_DIR));
        assert!(to_host.iter().any(|(_, local, _)| local == ws.path()));
    }

    let workers = transport.hosts_running("run_workers --num-workers 1 --master-host 10.0.0.1");
    assert_eq!(workers.len(), 2);
    let start = transport
        .execs()
        .into_iter()
        .find(|(_, cmd)| cmd.contains("run_workers"))
        .map(|(_, cmd)| cmd)
        .unwrap();
    assert!(start.starts_with(&format!("cd {REMOTE_STAGING_DIR} && swarm_runner")));

    assert_eq!(transport.hosts_running("pkill").len(), 2);
    assert!(coordinator.local_workers().is_empty());
    assert_eq!(
        coordinator.visited_states(),
        &[
            RunState::Idle,
            RunState::Distributing,
            RunState::SpawningWorkers,
            RunState::RunningMaster,
            RunState::CleaningUp,
            RunState::Completed
        ]
    );
}

#[tokio::test]
async fn remote_workers_need_a_master_host() {
    let ws = Workspace::new();
    let config = ws.config(&ws.fake_locust(0), 15606);
    let plan = load_plan(Role::RunWorkers, &ws)
        .workers(2)
        .drivers(["h1"]);
    let transport = Arc::new(MockTransport::default());

    let err = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new())
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(err.cause(), SwarmError::Config(_)));
    assert!(transport.hosts_running("run_workers").is_empty());
}

#[tokio::test]
async fn tunnelled_workers_connect_to_loopback() {
    let ws = Workspace::new();
    let mut config = ws.config(&ws.fake_locust(0), 15607);
    config.use_ssh_tunnel = true;
    let plan = load_plan(Role::Run, &ws).workers(1).drivers(["h1"]);
    let transport = Arc::new(MockTransport::default());

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new());
    coordinator.execute().await.expect("run failed");

    assert_eq!(
        transport.hosts_running("--master-host 127.0.0.1"),
        hosts(&["h1"])
    );
    assert!(coordinator
        .visited_states()
        .contains(&RunState::Tunneling));
}

#[tokio::test]
async fn run_standalone_streams_until_exit() {
    let ws = Workspace::new();
    let config = ws.config(&ws.fake_locust(0), 15608);
    let plan = load_plan(Role::RunStandalone, &ws);
    let transport = Arc::new(MockTransport::default());

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), InterruptHandle::new());
    coordinator.execute().await.expect("run_standalone failed");

    assert_eq!(transport.call_count(), 0);
    assert_eq!(
        coordinator.visited_states(),
        &[RunState::Idle, RunState::RunningMaster, RunState::Completed]
    );
}

#[tokio::test]
async fn interrupt_kills_master_and_cleans_up() {
    let ws = Workspace::new();
    let config = ws.config(&ws.hanging_locust(), 15609);
    let plan = load_plan(Role::RunMaster, &ws).workers(1).drivers(["h1"]);
    let transport = Arc::new(MockTransport::default());
    let interrupt = InterruptHandle::new();

    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.interrupt();
    });

    let mut coordinator = Coordinator::new(plan, config, transport.clone(), interrupt);
    let err = tokio::time::timeout(Duration::from_secs(10), coordinator.execute())
        .await
        .expect("master was not killed")
        .unwrap_err();

    assert!(err.is_interrupt());
    assert_eq!(err.exit_code(), 2);
    assert_eq!(transport.hosts_running("pkill"), hosts(&["h1"]));
}

#[tokio::test]
async fn missing_load_generator_fails_before_starting() {
    let ws = Workspace::new();
    let config = ws.config(&ws.path().join("no-such-locust"), 15610);
    let plan = load_plan(Role::RunStandalone, &ws);

    let err = Coordinator::new(plan, config, Arc::new(MockTransport::default()), InterruptHandle::new())
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(
        err.cause(),
        SwarmError::Command { exit_code: None, .. }
    ));
}

#[tokio::test]
async fn dispatch_covers_unreachable_hosts() {
    let transport = Arc::new(MockTransport::default().unreachable("h2"));
    let dispatcher = FleetDispatcher::new(transport.clone());

    let result = dispatcher
        .run_on_hosts(&hosts(&["h1", "h2", "h3"]), &FleetCommand::Same("uptime".into()), false)
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    assert!(result.get("h1").unwrap().success());
    assert!(result.get("h2").unwrap().is_transport_failure());
    assert_eq!(result.failures().count(), 1);
}
