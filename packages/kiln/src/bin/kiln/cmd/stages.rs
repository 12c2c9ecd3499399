use clap::Subcommand;

pub mod cleanup;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Drop stage artifacts whose owning image is no longer in the project
    Cleanup(cleanup::Options),
}
