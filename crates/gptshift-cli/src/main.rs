use gptshift_common::Anyhow;

pub mod cli;

pub fn main() -> Anyhow<()> {
    cli::main()
}
