use anyhow::Result;
use api::*;
use clap::{Parser, Subcommand};

use crate::client::Client;

mod api;
mod client;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,
}
#[derive(Subcommand)]
enum Commands {
    /// Submit a prediction for community validation
    Create {
        #[arg(short, long)]
        title: String,
        #[arg(short, long)]
        description: String,
        #[arg(short, long)]
        category: String,
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long)]
        creator: String,
    },
    Vote {
        #[arg(short, long)]
        prediction: RowId,
        #[arg(short, long)]
        voter: String,
        /// Vote against the prediction
        #[arg(long)]
        no: bool,
    },
    Active,
    Approved,
    Count,
    Get {
        #[arg(short, long)]
        prediction: RowId,
    },
    Stats {
        #[arg(short, long)]
        prediction: RowId,
    },
    HasVoted {
        #[arg(short, long)]
        prediction: RowId,
        #[arg(short, long)]
        voter: String,
    },
    Profile {
        #[arg(short, long)]
        creator: String,
    },
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let client = Client::new(cli.url);

    match cli.command {
        Commands::Create {
            title,
            description,
            category,
            days,
            creator,
        } => {
            let request = CreatePredictionRequest {
                title: Some(title),
                description: Some(description),
                category: Some(category),
                voting_period_days: Some(days),
                creator: Some(creator),
            };
            let response = client.create_prediction(&request).await?;
            println!("Created prediction {}: {}", response.id, response.message);
        }
        Commands::Vote {
            prediction,
            voter,
            no,
        } => {
            let response = client.vote(prediction, &voter, !no).await?;
            println!(
                "{}: {} yes / {} no, {}",
                response.message, response.yes_votes, response.no_votes, response.status
            );
        }
        Commands::Active => {
            let predictions = client.get_active_predictions().await?;
            print_predictions(&predictions);
        }
        Commands::Approved => {
            let predictions = client.get_approved_predictions().await?;
            print_predictions(&predictions);
        }
        Commands::Count => {
            println!("{}", client.get_prediction_count().await?);
        }
        Commands::Get { prediction } => {
            let response = client.get_prediction(prediction).await?;
            println!("{:#?}", response);
        }
        Commands::Stats { prediction } => {
            let stats = client.get_voting_stats(prediction).await?;
            println!(
                "{} yes / {} no of {}: {}%",
                stats.yes_votes, stats.no_votes, stats.total_votes, stats.approval_percentage
            );
        }
        Commands::HasVoted { prediction, voter } => {
            println!("{}", client.has_voted(prediction, &voter).await?);
        }
        Commands::Profile { creator } => {
            let profile = client.get_profile(&creator).await?;
            println!("{:#?}", profile);
        }
        Commands::Health => {
            let health = client.health().await?;
            println!("{:#?}", health);
        }
    }
    Ok(())
}
fn print_predictions(predictions: &[Prediction]) {
    for prediction in predictions {
        println!(
            "{:>4} [{}] {} ({} yes / {} no, ends {})",
            prediction.id,
            prediction.status,
            prediction.title,
            prediction.yes_votes,
            prediction.no_votes,
            prediction.end_time
        );
    }
}
