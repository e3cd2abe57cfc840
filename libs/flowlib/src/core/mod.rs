// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod bin;
pub mod broker;
pub mod cache;
pub mod config;
pub mod demux;
pub mod display;
pub mod error;
pub mod events;
pub mod frame;
pub mod mux;
pub mod node;
pub mod pipeline;
pub mod port;
pub mod queue;
pub mod record;
pub mod registry;
pub mod remuxer;
pub mod session;
pub mod sink;
pub mod source;
pub mod tee;

mod worker;

pub use bin::*;
pub use broker::*;
pub use cache::*;
pub use config::EngineConfig;
pub use demux::*;
pub use display::*;
pub use error::*;
pub use events::*;
pub use frame::*;
pub use mux::*;
pub use node::*;
pub use pipeline::*;
pub use port::*;
pub use queue::*;
pub use record::*;
pub use registry::*;
pub use remuxer::*;
pub use session::*;
pub use sink::*;
pub use source::*;
pub use tee::*;
