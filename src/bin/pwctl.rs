fn main() -> anyhow::Result<()> {
    procwatch::pw::pwctl_cli::run()
}
