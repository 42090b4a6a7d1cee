use anyhow::Context;

fn main() -> anyhow::Result<()> {
  let args: Vec<String> = std::env::args().collect();

  if args.iter().any(|a| a == "--version") {
    println!("{}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }

  let check = script_check::CheckArgs::from_args(&args)?;
  let flagged = script_check::run(&check).context("script-check run")?;
  if flagged {
    std::process::exit(2);
  }
  Ok(())
}
