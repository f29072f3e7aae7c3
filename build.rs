use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};
use tonic_build;

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=protos/raft.proto");
    build_proto()?;
    Ok(())
}

// Both the peer-to-peer raft service and the client facing KV service live in one proto package,
// so a single generated module covers the whole wire surface.
fn build_proto() -> io::Result<()> {
    idempotent_create_dir("./generated/")?;
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .out_dir("./generated/")
        .compile(&["./protos/raft.proto"], &["./protos/"])
}

fn idempotent_create_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            ErrorKind::AlreadyExists => Ok(()),
            _ => Err(e),
        },
    }
}
