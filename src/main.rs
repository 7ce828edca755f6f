use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{arg, command, ArgAction};
use disk_driver::file::FileDiskDriver;
use disk_driver::DiskDriver;
use fuser::MountOption;
use log::info;

use amnfs::fuse_fs::AmnfsFs;
use amnfs::host::DiskHost;

fn main() -> Result<()> {
    let matches = command!()
        .arg(arg!([mountpoint] "Mountpoint to mount the filesystem on").default_value("tests/mnt"))
        .arg(
            arg!(-d --device <FILE> "Device path (filesystem storage file)")
                .required(false)
                .default_value("ddriver"),
        )
        .arg(arg!(--format "Format the device before mounting").action(ArgAction::SetTrue))
        .arg(
            arg!(--"block-size" <N> "Block size in bytes")
                .required(false)
                .default_value("1024"),
        )
        .arg(
            arg!(--inodes <N> "Number of inodes to allocate when formatting")
                .required(false)
                .default_value("1024"),
        )
        .arg(arg!(-r --"read-only" "Mount as a read-only filesystem").action(ArgAction::SetTrue))
        .arg(arg!(-v --verbose "Enable debug logging, equivalent to RUST_LOG=debug").action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let mountpoint: &String = matches.get_one("mountpoint").unwrap();
    let device: &String = matches.get_one("device").unwrap();
    let block_size: u32 = matches
        .get_one::<String>("block-size")
        .unwrap()
        .parse()
        .context("parsing --block-size")?;
    let inodes_count: u32 = matches
        .get_one::<String>("inodes")
        .unwrap()
        .parse()
        .context("parsing --inodes")?;
    let read_only = matches.get_flag("read-only");
    let format = matches.get_flag("format");

    let mut driver = Box::new(FileDiskDriver::new());
    driver
        .ddriver_open(device)
        .with_context(|| format!("opening backing store {device}"))?;

    if !format {
        info!("loading an existing volume is out of scope for this host adapter, formatting fresh");
    }
    let host = DiskHost::format(driver, block_size, inodes_count)?;

    let fs = AmnfsFs::new(host);

    let mut options = vec![MountOption::FSName("amnfs".to_string())];
    options.push(if read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });

    let mountpoint = PathBuf::from(mountpoint);
    info!("mounting amnfs at {}", mountpoint.display());
    fuser::mount2(fs, &mountpoint, &options).context("mounting filesystem")?;
    Ok(())
}
