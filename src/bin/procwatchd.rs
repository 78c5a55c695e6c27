fn main() -> anyhow::Result<()> {
    procwatch::pw::cli::run()
}
