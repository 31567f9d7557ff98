use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nova_ecosystem::api::{self, AppState};
use nova_ecosystem::broker::{Broker, InMemoryBroker, PostgresBroker, StreamNames};
use nova_ecosystem::control::ControlClient;
use nova_ecosystem::params::ParameterTable;
use nova_ecosystem::registry::AgentRegistry;
use nova_ecosystem::safety::SafetyOrchestrator;
use nova_ecosystem::shutdown;
use nova_ecosystem::supervisor::{AlertCounter, StreamMonitor, Supervisor};
use nova_ecosystem::types::{AgentInfo, ControlCommand};
use nova_ecosystem::workflow::{
    BrokerStreamController, BrokerTaskTracker, ShellExecutor, WorkflowDeps, WorkflowStateMachine,
};
use nova_ecosystem::Config;

#[derive(Parser)]
#[command(name = "nova")]
#[command(about = "Safety-gated workflow coordination for Nova agents", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run this agent's supervised workflow until Ctrl-C
    Run,
    /// Switch an agent's operating mode
    Control {
        agent: String,
        #[arg(help = "man, auto or train")]
        command: String,
        #[arg(long, default_value = "operator")]
        operator: String,
    },
    /// Change a tunable parameter on an agent
    Tune {
        agent: String,
        param_type: String,
        param_name: String,
        value: String,
        #[arg(long, default_value = "operator")]
        operator: String,
    },
    /// List live agents
    Agents {
        #[arg(long)]
        capability: Option<String>,
    },
    /// Show tunable parameters with their bounds
    Params,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run => run_agent(config).await?,
        Commands::Control {
            agent,
            command,
            operator,
        } => send_control(config, &agent, &command, operator).await?,
        Commands::Tune {
            agent,
            param_type,
            param_name,
            value,
            operator,
        } => send_tuning(config, &agent, &param_type, &param_name, &value, operator).await?,
        Commands::Agents { capability } => list_agents(config, capability.as_deref()).await?,
        Commands::Params => list_params(&config),
    }

    Ok(())
}

async fn connect_postgres(url: &str) -> Result<Arc<dyn Broker>> {
    let broker = PostgresBroker::connect(url)
        .await
        .context("connecting to broker database")?;
    broker.run_migrations().await?;
    log::info!("Using PostgreSQL broker");
    Ok(Arc::new(broker))
}

async fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    match &config.database_url {
        Some(url) => connect_postgres(url).await,
        None => {
            log::warn!("DATABASE_URL not set; using an in-process broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
    }
}

/// Operator commands talk to agents through the shared broker, so an
/// in-process fallback would only reach a log nobody reads.
fn shared_broker_url(config: &Config) -> Result<&str> {
    config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required to reach other agents")
}

async fn connect_shared_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    connect_postgres(shared_broker_url(config)?).await
}

async fn run_agent(config: Config) -> Result<()> {
    let broker = connect_broker(&config).await?;
    let names = StreamNames::new(config.system.clone());
    let (shutdown_tx, shutdown) = shutdown::channel();

    let safety = Arc::new(SafetyOrchestrator::new(config.safety.clone()));
    let registry = Arc::new(
        AgentRegistry::new(
            broker.clone(),
            names.clone(),
            config.registry.clone(),
            config.routing.clone(),
        )
        .with_shutdown(shutdown.clone()),
    );

    let deps = WorkflowDeps {
        safety: safety.clone(),
        registry: registry.clone(),
        streams: Arc::new(BrokerStreamController::new(
            broker.clone(),
            names.clone(),
            config.agent_id.clone(),
            config.workflow.broker_read_timeout(),
        )),
        tasks: Arc::new(BrokerTaskTracker::new(
            broker.clone(),
            names.clone(),
            config.agent_id.clone(),
        )),
        executor: Arc::new(ShellExecutor::new(config.workflow.task_timeout())),
    };
    let agent = AgentInfo::new(
        config.agent_id.clone(),
        config.role.clone(),
        config.capabilities.clone(),
    );
    let machine = WorkflowStateMachine::new(config.clone(), agent, deps);
    let mut supervisor = Supervisor::new(machine, safety.clone(), registry.clone());

    let monitor = StreamMonitor::new(
        broker.clone(),
        vec![names.priority_alerts()],
        format!("{}-alerts", config.agent_id),
        config.agent_id.clone(),
        config.monitor.clone(),
        Arc::new(AlertCounter::new()),
    );
    let monitor_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });

    let api_task = config.api_port.map(|port| {
        let state = AppState {
            safety: safety.clone(),
            registry: registry.clone(),
            workflow: supervisor.subscribe(),
        };
        let shutdown = shutdown.clone();
        tokio::spawn(async move { api::serve(state, port, shutdown).await })
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let cycles = supervisor.run(shutdown).await?;
    log::info!("{} stopped after {} cycle(s)", config.agent_id, cycles);

    match monitor_task.await {
        Ok(Ok(handled)) => log::info!("Alert monitor handled {} message(s)", handled),
        Ok(Err(e)) => log::warn!("Alert monitor failed: {}", e),
        Err(e) => log::warn!("Alert monitor task panicked: {}", e),
    }
    if let Some(task) = api_task {
        match task.await {
            Ok(result) => result?,
            Err(e) => log::warn!("Status API task panicked: {}", e),
        }
    }
    Ok(())
}

fn control_client(config: &Config, broker: Arc<dyn Broker>, operator: String) -> ControlClient {
    ControlClient::new(
        broker,
        StreamNames::new(config.system.clone()),
        operator,
        ParameterTable::from_config(config),
    )
}

async fn send_control(config: Config, agent: &str, command: &str, operator: String) -> Result<()> {
    let command: ControlCommand = command.parse().map_err(anyhow::Error::msg)?;
    let broker = connect_shared_broker(&config).await?;
    let id = control_client(&config, broker, operator)
        .send_mode(agent, command)
        .await?;
    println!("Sent {} to {} (entry {})", command.as_str(), agent, id);
    Ok(())
}

async fn send_tuning(
    config: Config,
    agent: &str,
    param_type: &str,
    param_name: &str,
    value: &str,
    operator: String,
) -> Result<()> {
    let broker = connect_shared_broker(&config).await?;
    let id = control_client(&config, broker, operator)
        .send_parameter_change(agent, param_type, param_name, value)
        .await?;
    println!(
        "Sent {}.{} = {} to {} (entry {})",
        param_type, param_name, value, agent, id
    );
    Ok(())
}

async fn list_agents(config: Config, capability: Option<&str>) -> Result<()> {
    let broker = connect_shared_broker(&config).await?;
    let registry = AgentRegistry::new(
        broker,
        StreamNames::new(config.system.clone()),
        config.registry.clone(),
        config.routing.clone(),
    );

    let agents = registry.discover(capability).await?;
    if agents.is_empty() {
        println!("No live agents");
        return Ok(());
    }
    for agent in agents {
        let capabilities: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<20} {:<8} {:<12} [{}] success {:.0}%",
            agent.agent_id,
            agent.status.as_str(),
            agent.role,
            capabilities.join(", "),
            agent.performance.success_rate() * 100.0
        );
    }
    Ok(())
}

fn list_params(config: &Config) {
    for param in ParameterTable::from_config(config).iter() {
        println!(
            "{:<36} {:>10}  [{}, {}] {}",
            param.key(),
            param.current,
            param.min,
            param.max,
            param.unit
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_commands_require_shared_broker() {
        let mut config = Config::default();
        config.database_url = None;
        let err = shared_broker_url(&config).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        config.database_url = Some("postgres://nova@localhost/nova".into());
        assert_eq!(
            shared_broker_url(&config).unwrap(),
            "postgres://nova@localhost/nova"
        );
    }
}
