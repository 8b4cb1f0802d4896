//! Standalone local-testing harness for the engine (SPEC_FULL.md, "CLI /
//! standalone harness"). Linux-only convenience: opens a TUN device itself
//! and drives it through the same `Supervisor` control API a real host
//! would use, styled after `ferron/src/main.rs`'s `clap::Parser` CLI.

use std::os::fd::{AsRawFd, RawFd};

use clap::Parser;
use snirect::Supervisor;
use snirect_common::callbacks::EngineCallbacks;

#[derive(Parser, Debug)]
#[command(name = "snirect-harness", about = "Local test harness for the snirect engine")]
struct Args {
  /// Path to the JSON rule configuration.
  #[arg(long)]
  config: std::path::PathBuf,

  /// TUN interface name to create (Linux only).
  #[arg(long, default_value = "snirect0")]
  tun_name: String,

  /// Directory the CA key/cert pair is persisted under.
  #[arg(long, default_value = "./snirect-data")]
  data_dir: std::path::PathBuf,
}

struct StdoutCallbacks;

impl EngineCallbacks for StdoutCallbacks {
  fn on_status_changed(&self, status: &str) {
    println!("[status] {status}");
  }

  fn on_speed_updated(&self, up_delta: u64, down_delta: u64) {
    println!("[speed] up={up_delta}B/s down={down_delta}B/s");
  }

  fn protect(&self, _fd: RawFd) -> bool {
    // The harness runs outside any per-app routing sandbox, so there is
    // nothing to bypass; every socket is already "protected".
    true
  }
}

#[cfg(target_os = "linux")]
fn open_tun(name: &str) -> std::io::Result<std::fs::File> {
  use std::os::unix::fs::OpenOptionsExt;

  const IFF_TUN: libc::c_short = 0x0001;
  const IFF_NO_PI: libc::c_short = 0x1000;
  const TUNSETIFF: libc::c_ulong = 0x400454ca;

  #[repr(C)]
  struct IfReq {
    name: [libc::c_char; 16],
    flags: libc::c_short,
    _pad: [u8; 22],
  }

  let file = std::fs::OpenOptions::new()
    .read(true)
    .write(true)
    .custom_flags(libc::O_CLOEXEC)
    .open("/dev/net/tun")?;

  let mut req: IfReq = unsafe { std::mem::zeroed() };
  for (i, byte) in name.bytes().take(15).enumerate() {
    req.name[i] = byte as libc::c_char;
  }
  req.flags = IFF_TUN | IFF_NO_PI;

  let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &req) };
  if ret < 0 {
    return Err(std::io::Error::last_os_error());
  }

  Ok(file)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = Args::parse();

  #[cfg(not(target_os = "linux"))]
  {
    let _ = &args;
    anyhow::bail!("snirect-harness only opens TUN devices on Linux; embed the library against a host-supplied fd elsewhere");
  }

  #[cfg(target_os = "linux")]
  {
    let config_json = tokio::fs::read_to_string(&args.config).await?;
    let tun = open_tun(&args.tun_name)?;
    let fd = tun.as_raw_fd();
    std::mem::forget(tun); // ownership transfers into the engine

    let supervisor = Supervisor::new();
    supervisor.set_data_dir(args.data_dir).await;
    supervisor
      .start_engine(fd, &config_json, std::sync::Arc::new(StdoutCallbacks))
      .await?;

    println!("snirect engine running on {}; ctrl-c to stop", args.tun_name);
    tokio::signal::ctrl_c().await?;
    supervisor.stop_engine().await?;
  }

  Ok(())
}
