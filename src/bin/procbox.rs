use anyhow::Result;

fn main() -> Result<()> {
    let code = procbox::cli::run()?;
    std::process::exit(code);
}
