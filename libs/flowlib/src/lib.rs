// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Suppress pedantic clippy warnings that are intentional design choices
#![allow(clippy::type_complexity)] // Complex types are clear in context
#![allow(clippy::new_without_default)] // Fallible constructors have no meaningful Default

pub mod core;

pub use core::{
    attach_sink,
    clamp_session,
    detach_sink,
    link_nodes,
    link_nodes_with_capacity,
    read_dump,
    unlink_nodes,
    Bin,
    BusMessage,
    BusSender,
    ColorPalette,
    ContainerKind,
    ContainerWriter,
    Demuxer,
    EngineConfig,
    EosEvent,
    ErrorEvent,
    EventBridge,
    FakeSink,
    FlowError,
    FlowNode,
    Frame,
    FrameCache,
    GrantedPort,
    LinkState,
    ListenerSet,
    LoopbackBroker,
    MessageBroker,
    Muxer,
    NodeCore,
    NodeKind,
    OnDemandColor,
    OverlaySink,
    Pipeline,
    PipelineState,
    Port,
    PortAddress,
    PortKind,
    PortRole,
    Queue,
    RandomColor,
    RawDumpWriter,
    RecordSink,
    RecordingEvent,
    RecordingInfo,
    Remuxer,
    Result,
    RgbaColor,
    SessionMachine,
    SessionState,
    SessionWindow,
    StateTransition,
    Tee,
    TerminalNode,
    TestSource,
    DEFAULT_CACHE_WINDOW,
    DEFAULT_FANOUT_CAPACITY,
    DEFAULT_LINK_CAPACITY,
    DEFAULT_MAX_SESSION,
};
