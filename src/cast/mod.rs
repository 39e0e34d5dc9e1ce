//! Generated CASTV2 wire types; see `protos/cast_channel.proto`.

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
