use std::path::PathBuf;

use clap::{ColorChoice, Parser};

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The journal file holding the object store
    #[arg(
        long,
        global = true,
        env = "PATCHWORKS_STORE",
        default_value = "patchworks-store.json"
    )]
    pub store: PathBuf,
}

impl Options {
    /// Whether log output should be colored.
    pub fn use_color(&self) -> bool {
        use std::io::IsTerminal as _;
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }
}
