#[derive(clap::Parser, Debug, Clone)]
#[command(version, about, long_about=None)]
pub struct Args {
    /// Number of RAM disks on the chain
    #[arg(short, long, default_value_t = 2)]
    pub(crate) devices: usize,

    /// Blocks per disk
    #[arg(short, long, default_value_t = 16)]
    pub(crate) blocks: usize,

    /// Block reads and writes to script after INIT
    #[arg(short = 'n', long, default_value_t = 8)]
    pub(crate) operations: usize,

    /// Seed for disk contents and the host script; random if not specified
    #[arg(short, long)]
    pub(crate) seed: Option<u64>,

    /// Unit identity the host hands to the first device
    #[arg(long, default_value_t = 0x81, value_parser=clap_num::maybe_hex::<u8>)]
    pub(crate) first_unit: u8,

    /// Increase message verbosity
    #[arg(short='v', action=clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Silence all output
    #[arg(short, long)]
    pub(crate) quiet: bool,
}
