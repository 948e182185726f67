use anyhow::Result;
use clap::{Parser, Subcommand};
use loomcore::{
    validate, ConditionConfig, ConditionType, EndConfig, EndOutputType, ExecutionEvent,
    InputVariable, NodeConfig, StartConfig, Value, VarType, Workflow, WorkflowNode,
};
use loomnodes::{AgentHostClient, Capabilities, HttpLlmClient};
use loomruntime::{RuntimeConfig, WorkflowRuntime};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Loom workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List the node kinds the engine supports
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
        } => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            };
            tracing_subscriber::fmt().with_max_level(level).init();

            run_workflow(file, input).await?;
        }

        Commands::Validate { file } => {
            validate_file(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn capabilities_from_env() -> Capabilities {
    let llm_base =
        std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm_key = std::env::var("LLM_API_KEY").ok();
    let host_base =
        std::env::var("AGENT_HOST_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let host_key = std::env::var("AGENT_HOST_API_KEY").ok();

    Capabilities {
        llm: Arc::new(HttpLlmClient::new(llm_base, llm_key)),
        host: Arc::new(AgentHostClient::new(host_base, host_key)),
        http: reqwest::Client::new(),
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>) -> Result<()> {
    println!("Loading workflow from: {}", file.display());

    let workflow_json = std::fs::read_to_string(&file)?;
    let workflow: Workflow = serde_json::from_str(&workflow_json)?;

    println!("Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let inputs: HashMap<String, Value> = match input {
        Some(input_str) => {
            let json: serde_json::Value = serde_json::from_str(&input_str)?;
            let serde_json::Value::Object(obj) = json else {
                return Err(anyhow::anyhow!("Input must be a JSON object"));
            };
            obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
        }
        None => HashMap::new(),
    };

    let validated = match validate(workflow) {
        Ok(validated) => Arc::new(validated),
        Err(report) => {
            println!("Workflow is invalid:");
            for error in &report.errors {
                println!("   - {}", error);
            }
            return Err(anyhow::anyhow!("validation failed"));
        }
    };
    for warning in validated.warnings() {
        println!("   warning: {}", warning);
    }

    let executors = loomnodes::standard_executors(capabilities_from_env());
    let runtime = WorkflowRuntime::new(executors, RuntimeConfig::default());

    let mut events = runtime.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { .. } => {
                    println!("Run started");
                }
                ExecutionEvent::NodeStarted { node_id, kind, .. } => {
                    println!("  > {} ({})", node_id, kind.as_str());
                }
                ExecutionEvent::NodeCompleted {
                    node_id,
                    branch,
                    duration_ms,
                    ..
                } => match branch {
                    Some(branch) => {
                        println!("  + {} took branch '{}' ({}ms)", node_id, branch, duration_ms)
                    }
                    None => println!("  + {} completed in {}ms", node_id, duration_ms),
                },
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ! {} failed: {}", node_id, error);
                }
                ExecutionEvent::NodeSkipped { node_id, .. } => {
                    println!("  - {} skipped", node_id);
                }
                ExecutionEvent::NodeLog {
                    node_id, message, ..
                } => {
                    println!("    [{}] {}", node_id, message);
                }
                ExecutionEvent::RunCompleted {
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("Run completed in {}ms", duration_ms);
                    } else {
                        println!("Run failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let run_id = runtime.submit_validated(validated, inputs).await;
    let snapshot = runtime.wait(&run_id).await?;

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("Run {}: {:?}", snapshot.run_id, snapshot.status);
    if let Some(output) = &snapshot.output {
        println!("Output: {}", output.to_display());
    }

    Ok(())
}

fn validate_file(file: PathBuf) -> Result<()> {
    println!("Validating workflow: {}", file.display());

    let workflow_json = std::fs::read_to_string(&file)?;
    let workflow: Workflow = serde_json::from_str(&workflow_json)?;
    let name = workflow.name.clone();
    let nodes = workflow.nodes.len();
    let edges = workflow.edges.len();

    match validate(workflow) {
        Ok(validated) => {
            println!("Workflow is valid:");
            println!("   Name: {}", name);
            println!("   Nodes: {}", nodes);
            println!("   Edges: {}", edges);
            for warning in validated.warnings() {
                println!("   warning: {}", warning);
            }
            Ok(())
        }
        Err(report) => {
            println!("Workflow is invalid:");
            for error in &report.errors {
                println!("   - {}", error);
            }
            Err(anyhow::anyhow!("validation failed"))
        }
    }
}

fn list_nodes() {
    println!("Supported node kinds:");
    println!();
    for kind in loomcore::NodeKind::ALL {
        println!("  - {}", kind.as_str());
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Branching Workflow");
    workflow.description = Some("Routes the input to one of two ends".to_string());

    workflow.add_node(WorkflowNode::new(
        "start",
        "start",
        NodeConfig::Start(StartConfig {
            input_variables: vec![InputVariable {
                name: "user_input".to_string(),
                var_type: VarType::String,
                description: Some("Text to route".to_string()),
            }],
        }),
    ));
    workflow.add_node(WorkflowNode::new(
        "check",
        "check",
        NodeConfig::Condition(ConditionConfig {
            condition_type: ConditionType::Expression,
            expression: Some("{{start.user_input}} == hello".to_string()),
            ..Default::default()
        }),
    ));
    workflow.add_node(WorkflowNode::new(
        "end_yes",
        "end_yes",
        NodeConfig::End(EndConfig {
            output_type: EndOutputType::Template,
            output_template: Some("Greeting received: {{start.user_input}}".to_string()),
            ..Default::default()
        }),
    ));
    workflow.add_node(WorkflowNode::new(
        "end_no",
        "end_no",
        NodeConfig::End(EndConfig {
            output_type: EndOutputType::Template,
            output_template: Some("Not a greeting".to_string()),
            ..Default::default()
        }),
    ));
    workflow.connect("start", "check");
    workflow.connect_branch("check", "end_yes", "true");
    workflow.connect_branch("check", "end_no", "false");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  loom run --file {} --input '{{\"user_input\": \"hello\"}}'",
        output.display()
    );

    Ok(())
}
