// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod codec;
pub mod endpoint;
pub mod message;
pub mod plugin;
pub mod proto;
pub mod router;
pub mod session;
pub mod status;
pub mod tfilter;
pub mod transport;

pub use codec::{Codec, Payload};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use message::{Message, MessageSetting, MessageType, Meta};
pub use plugin::{Hooks, Plugin, PluginContainer, ReadCtx, WriteCtx};
pub use router::{CallCtx, PushCtx, Router};
pub use session::{CallCmd, Session, SessionState};
pub use status::{Code, Status, is_conn_error};
pub use tern_config::EndpointConfig;
