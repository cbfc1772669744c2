fn main() -> anyhow::Result<()> {
    roomlink_lib::run()
}
