//! Inspects and maintains `memostash` cache directories.

mod cli;
mod digest;
mod output;

#[tokio::main]
async fn main() {
    match cli::execute().await {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            memostash::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
