use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Drive a segment loader against an HLS media playlist",
    long_about = "Fetches an HLS media playlist, feeds it to a segment loader and plays it\n\
                  back on a simulated clock. Every appended segment is written to the\n\
                  output file. Live playlists are refreshed once per target duration\n\
                  until the stream ends or a fatal error occurs."
)]
pub struct CliArgs {
    /// Media playlist URL
    #[arg(required = true, help = "URL of an HLS media playlist (not a master playlist)")]
    pub url: String,

    /// Output file for appended segment bytes
    #[arg(short, long, default_value = "out.ts", help = "File receiving appended segment bytes")]
    pub output: PathBuf,

    /// Seconds of media to keep buffered ahead of the playhead
    #[arg(
        long,
        default_value = "30",
        help = "Goal buffer length in seconds ahead of the simulated playhead"
    )]
    pub goal_buffer: f64,

    /// Playback speed of the simulated clock
    #[arg(
        long,
        default_value = "1",
        help = "Simulated playback speed as a multiple of real time"
    )]
    pub speed: f64,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Overall timeout in seconds for HTTP requests
    #[arg(long, default_value = "30", help = "Overall timeout in seconds for HTTP requests")]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Non-fatal loader errors tolerated before giving up
    #[arg(
        long,
        default_value = "3",
        help = "Number of non-fatal loader errors to retry before exiting"
    )]
    pub max_retries: u32,

    /// Custom HTTP headers
    #[arg(
        short = 'H',
        long = "header",
        help = "Add custom HTTP header (format: 'Name: Value'). Can be used multiple times."
    )]
    pub headers: Vec<String>,
}
