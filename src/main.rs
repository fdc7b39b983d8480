fn main() -> anyhow::Result<()> {
    finetune_lib::run()
}
