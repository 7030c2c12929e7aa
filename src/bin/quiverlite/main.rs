use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_init;
mod cmd_put;
mod cmd_get;
mod cmd_del;
mod cmd_scan;
mod cmd_tables;
mod cmd_drop_table;
mod cmd_stat;
mod cmd_checkpoint;
mod cmd_vacuum;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    // Пример: RUST_LOG=debug ./quiverlite ...
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Init { path, page_size, salt, overwrite } =>
            cmd_init::exec(path, page_size, salt, overwrite),

        cli::Cmd::Put { path, table, hash, key_size, key, value, value_file } =>
            cmd_put::exec(path, cli::TableArg { name: table, hash, key_size }, key, value, value_file),

        cli::Cmd::Get { path, table, key, out } =>
            cmd_get::exec(path, table, key, out),

        cli::Cmd::Del { path, table, key } =>
            cmd_del::exec(path, table, key),

        cli::Cmd::Scan { path, table, prefix, reverse, limit, json } =>
            cmd_scan::exec(path, table, prefix, reverse, limit, json),

        cli::Cmd::Tables { path, json } =>
            cmd_tables::exec(path, json),

        cli::Cmd::DropTable { path, table } =>
            cmd_drop_table::exec(path, table),

        cli::Cmd::Stat { path, json } =>
            cmd_stat::exec(path, json),

        cli::Cmd::Checkpoint { path } =>
            cmd_checkpoint::exec(path),

        cli::Cmd::Vacuum { path, json } =>
            cmd_vacuum::exec(path, json),
    }
}
