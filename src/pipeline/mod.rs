// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{api::push::PushDataList, mqtt::MqttSink};

pub mod channel;
pub mod reader;
pub mod supervisor;

/// Additional consumers of the demultiplexed reading stream, shared by all
/// reader tasks.
#[derive(Clone, Default)]
pub struct Sinks {
    pub push: Option<Arc<PushDataList>>,
    pub mqtt: Option<Arc<MqttSink>>,
}
