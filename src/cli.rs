use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "blockgraph",
    about = "Loads a block workspace (XML or JSON) and prints the equivalent Python program."
)]
pub struct Args {
    #[arg(value_name = "INPUT", default_value = "input.xml")]
    pub input: PathBuf,

    #[arg(long, help = "Read INPUT as the JSON workspace form instead of XML.")]
    pub json: bool,

    #[arg(long, help = "Write the loaded workspace back out as XML to this path.")]
    pub emit_xml: Option<PathBuf>,

    #[arg(long, help = "Write the loaded workspace back out as JSON to this path.")]
    pub emit_json: Option<PathBuf>,

    #[arg(
        long,
        help = "Fail on unknown block types instead of loading them as placeholders."
    )]
    pub strict_types: bool,

    #[arg(short, long, help = "Log debug output to stderr.")]
    pub verbose: bool,
}
