use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("muxrpc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: muxrpc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("MUXRPC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("MUXRPC_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("protocol_magic: {:#x}", muxrpc_peer::MAGIC_NUMBER);
    println!(
        "codecs: {}",
        muxrpc_frame::Codec::ALL
            .iter()
            .map(|codec| codec.content_type())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "features: peer=true, async={}, cli=true",
        cfg!(feature = "async")
    );

    Ok(SUCCESS)
}
