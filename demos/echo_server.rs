//! Length-prefixed echo server over every available core.
//!
//! Frames are a 4-byte big-endian length followed by that many bytes;
//! each frame is echoed back verbatim, length included. Try it with
//! `cargo run --example echo_server`.

use gale::{Buffer, CpuSet, Status};

fn main() -> gale::Result<()> {
    let cpus = CpuSet::builder().add_default_pack().build()?;
    cpus.start()?;

    let addr = "127.0.0.1:31339".parse().expect("valid listen address");
    cpus.get(0)
        .expect("cpu 0 exists")
        .listen(
            addr,
            |channel| {
                channel.serve(|ch| {
                    let output = ch.output();
                    ch.input()
                        .read_with(|buf: &mut Buffer| {
                            if buf.readable_bytes() < 4 {
                                return Status::Continue;
                            }
                            buf.mark_reader_index();
                            let len = buf.read_i32() as usize;
                            if buf.readable_bytes() < len {
                                buf.reset_reader_index();
                                return Status::Continue;
                            }
                            Status::StopWith(buf.read_bytes(len))
                        })
                        .flat_map(move |payload| {
                            output
                                .write_i32(payload.readable_bytes() as i32)
                                .write_bytes(payload.as_slice());
                            output.flush()
                        })
                });
            },
            |failure| eprintln!("listener failed: {failure}"),
        )
        .and_then(|addr| println!("echoing length-prefixed frames on {addr}"));

    loop {
        std::thread::park();
    }
}
