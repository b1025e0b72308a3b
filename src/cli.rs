use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Visual and text similarity search over a product catalog", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate cli docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Serve the search api
    Daemon {
        /// Address to listen on, overrides server.listen
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Build the index from the catalog and save it
    BuildIndex {
        /// Only embed catalog records missing from the saved index
        #[clap(short, long, default_value = "false")]
        append: bool,
    },

    /// Search the saved index
    Search {
        /// Url of an image to find similar items for
        #[clap(short, long, conflicts_with_all = ["text", "board"])]
        image: Option<String>,

        /// Free-text description
        #[clap(short, long, conflicts_with = "board")]
        text: Option<String>,

        /// Image urls forming a mood board (repeat or comma separate)
        #[clap(short, long, num_args = 1.., value_delimiter = ',')]
        board: Vec<String>,

        /// Number of results
        #[clap(short)]
        k: Option<usize>,
    },

    /// Print details of the saved index
    Info {},
}
