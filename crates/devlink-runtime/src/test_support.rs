//! Runtime pieces wired together without a device.

use std::sync::Arc;

use devlink_core::{LastValueCache, MemoryConfigStorage};

use crate::bus::{Bus, BusCore};
use crate::config::DevlinkConfig;
use crate::network::{NoopJoiner, StaticDetector};
use crate::provisioning::Provisioning;
use crate::session::SessionDirectory;
use crate::transport::Transport;

pub(crate) struct TestStack {
    pub bus: Bus,
    pub provisioning: Provisioning,
    pub transport: Arc<Transport>,
    pub sessions: Arc<SessionDirectory>,
}

/// Must be called from within a Tokio runtime.
pub(crate) fn stack() -> TestStack {
    let config = DevlinkConfig::default();
    let sessions = Arc::new(SessionDirectory::new(
        Arc::new(MemoryConfigStorage::new()),
        config.session.expiry(),
    ));
    let core = Arc::new(BusCore::new(LastValueCache::new(), config.bus.subscriber_buffer));
    let transport = Arc::new(Transport::new(
        config.transport.clone(),
        config.provisioning.clone(),
        core.clone(),
        sessions.clone(),
        Arc::new(NoopJoiner),
        Arc::new(StaticDetector::default()),
    ));
    let bus = Bus::new(core, transport.clone(), config.transport.reply_timeout());
    let provisioning = Provisioning::start(bus.clone(), sessions.clone(), &config.provisioning)
        .expect("provisioning subscriptions use valid patterns");
    TestStack {
        bus,
        provisioning,
        transport,
        sessions,
    }
}
