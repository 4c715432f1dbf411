use std::{
    env, fs,
    path::PathBuf,
    process::{self, Command},
};

use ovmf_prebuilt::{Arch, FileType, Prebuilt, Source};

fn main() {
    let ovmf_code = if let Ok(path) = env::var("TURNSTONE_OVMF_CODE_PATH") {
        PathBuf::from(path)
    } else {
        let prebuilt = Prebuilt::fetch(Source::LATEST, "target/ovmf").unwrap();
        prebuilt.get_file(Arch::X64, FileType::Code)
    };
    let ovmf_vars_src = if let Ok(path) = env::var("TURNSTONE_OVMF_VARS_PATH") {
        PathBuf::from(path)
    } else {
        let prebuilt = Prebuilt::fetch(Source::LATEST, "target/ovmf").unwrap();
        prebuilt.get_file(Arch::X64, FileType::Vars)
    };
    // QEMU requires VARS to be writable; copy to a temp file.
    let vars_dst: PathBuf = {
        let mut p = env::temp_dir();
        p.push("OVMF_VARS.fd");
        let _ = fs::copy(&ovmf_vars_src, &p);
        p
    };

    let mut qemu = Command::new("qemu-system-x86_64");

    let uefi_img = PathBuf::from(env!("UEFI_IMAGE"));
    if !uefi_img.exists() {
        eprintln!("[qemu-uefi] UEFI image missing: {}", uefi_img.display());
    }

    qemu.args(["-pflash", &ovmf_code.display().to_string()]);
    qemu.args(["-pflash", &vars_dst.display().to_string()]);
    qemu.args([
        "-drive",
        &format!("if=none,id=hd,format=raw,media=disk,file={}", uefi_img.display()),
        "-device",
        "virtio-blk-pci,drive=hd,bootindex=0",
    ]);
    qemu.args([
        "-machine", "accel=tcg",
        "-cpu", "qemu64",
        "-smp", "1",
        "-m", "512",
        "-nographic",
        "-monitor", "none",
        "-boot", "strict=on",
        "-no-reboot",
        "-no-shutdown",
        "-device", "isa-debug-exit,iobase=0xf4,iosize=0x04",
    ]);

    let extra_args: Vec<String> = env::args().skip(1).collect();
    if !extra_args.is_empty() {
        qemu.args(&extra_args);
    }

    eprintln!("[qemu-uefi] launching QEMU...");
    let exit_status = qemu.status().unwrap();
    process::exit(exit_status.code().unwrap_or(-1));
}
