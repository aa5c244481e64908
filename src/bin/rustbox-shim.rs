use anyhow::Result;

fn main() -> Result<()> {
    rustbox_shim::cli::run()
}
