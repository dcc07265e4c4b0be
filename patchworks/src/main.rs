mod application;
mod engine;
mod interrupt;
mod logging;
mod manifest;
mod objects;
mod options;

use anyhow::Result;
use application::handle_result;
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "patchworks", &mut std::io::stdout());
            Ok(())
        }
        command => {
            let mut logging = logging::set_up(logging::Options {
                verbose: args.options.verbose,
                color: args.options.use_color(),
            })?;
            let r = run_command(&args.options, command);
            logging.tear_down()?;
            r
        }
    }
}

fn run_command(options: &Options, command: &Commands) -> Result<()> {
    let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
    let rt = application::runtime()?;
    rt.block_on(async {
        match command {
            Commands::Create(args) => objects::create(options, args).await,
            Commands::Get(args) => objects::get(options, args).await,
            Commands::Delete(args) => objects::delete(options, args).await,
            Commands::Render(args) => engine::render(options, &interrupt_state, args).await,
            Commands::Reconcile(args) => engine::reconcile(options, &interrupt_state, args).await,
            Commands::Sync(args) => engine::sync(options, &interrupt_state, args).await,
            Commands::GenerateMan
            | Commands::GenerateMarkdown
            | Commands::GenerateCompletion { .. } => Ok(()),
        }
    })
}

/// Patchworks: render templates into patches for existing objects, and take
/// them back when the patch is deleted
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add the objects from manifest files to the store
    Create(objects::CreateArgs),

    /// Print an object from the store
    Get(objects::GetArgs),

    /// Request deletion of an object. Objects with finalizers are only marked.
    Delete(objects::ObjectArgs),

    /// Resolve a patch's source and print the rendered template, without
    /// changing anything
    Render(engine::PatchArgs),

    /// Run a single reconcile step for a patch
    Reconcile(engine::PatchArgs),

    /// Reconcile all patches until there is nothing left to do
    Sync(engine::SyncArgs),

    /// Generate markdown documentation for patchworks
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for patchworks
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for patchworks
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
