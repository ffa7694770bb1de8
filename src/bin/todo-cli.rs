use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

#[derive(Parser)]
#[command(name = "todo-cli")]
#[command(about = "Command-line client for the todo gateway", long_about = None)]
struct Cli {
    #[arg(short, long, env = "TODO_GATEWAY_URL", default_value = "http://localhost:10000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all todos
    List,
    /// Show one todo
    Get { id: String },
    /// Create a todo
    Create {
        text: String,
        #[arg(long)]
        done: bool,
    },
    /// Change the text or completion of a todo
    Update {
        id: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        done: Option<bool>,
    },
    /// Delete a todo
    Delete { id: String },
    /// Check a gateway health route (get, post, patch, delete)
    Health {
        #[arg(default_value = "get")]
        operation: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::List => client.get(format!("{base}/todo")).send().await?,
        Commands::Get { id } => client.get(format!("{base}/todo/{id}")).send().await?,
        Commands::Create { text, done } => {
            client
                .post(format!("{base}/todo"))
                .json(&json!({ "text": text, "done": done }))
                .send()
                .await?
        }
        Commands::Update { id, text, done } => {
            let mut body = Map::new();
            if let Some(text) = text {
                body.insert("text".into(), Value::String(text));
            }
            if let Some(done) = done {
                body.insert("done".into(), Value::Bool(done));
            }
            client
                .patch(format!("{base}/todo/{id}"))
                .json(&body)
                .send()
                .await?
        }
        Commands::Delete { id } => client.delete(format!("{base}/todo/{id}")).send().await?,
        Commands::Health { operation } => {
            client
                .get(format!("{base}/todo/{operation}/health"))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if text.is_empty() => println!("{}", status),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
