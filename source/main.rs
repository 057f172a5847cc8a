use clap::Parser as _;

#[derive(clap::Parser)]
struct Arguments {
  #[clap(flatten)]
  arguments: notmuch_sync::Arguments,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  env_logger::Builder::new()
    .filter_level(if arguments.arguments.verbose {
      log::LevelFilter::Debug
    } else {
      log::LevelFilter::Info
    })
    .parse_env("RUST_LOG")
    .init();

  notmuch_sync::run(&arguments.arguments)
}
