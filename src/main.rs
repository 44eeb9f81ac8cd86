//! Host-side runner: boots a built loader image under QEMU.

use std::path::PathBuf;
use std::process::{self, Command};

use clap::Parser;

#[derive(Parser)]
#[command(about = "Run the duoboot loader under qemu-system-riscv64")]
struct Args {
    /// Loader ELF image to boot.
    #[arg(
        long,
        default_value = "loader/target/riscv64imac-unknown-none-elf/release/loader"
    )]
    image: PathBuf,

    /// Number of harts.
    #[arg(long, default_value_t = 2)]
    smp: usize,

    /// Guest-visible memory size.
    #[arg(long, default_value = "256M")]
    memory: String,

    /// QEMU binary to use.
    #[arg(long, default_value = "qemu-system-riscv64")]
    qemu: String,
}

fn main() {
    let args = Args::parse();

    let status = Command::new(&args.qemu)
        .args(["-machine", "virt", "-nographic"])
        .args(["-smp", &args.smp.to_string()])
        .args(["-m", &args.memory])
        .arg("-bios")
        .arg(&args.image)
        .status();

    match status {
        Ok(status) => process::exit(status.code().unwrap_or(1)),
        Err(err) => {
            eprintln!("failed to launch {}: {err}", args.qemu);
            process::exit(1);
        }
    }
}
