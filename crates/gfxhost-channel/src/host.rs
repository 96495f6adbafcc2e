use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gfxhost_cdma::{Cdma, CdmaError, CdmaHw, NullCdmaHw};
use gfxhost_syncpt::{Intr, SyncptError, SyncptRegistry, WaitOutcome};

use crate::channel::{Channel, ChannelInit, Interrupt, SubmitReceipt};
use crate::config::{ChannelConfig, HostConfig};
use crate::error::{HostError, Result, SubmitError};
use crate::job::Job;
use crate::mem::MemoryManager;
use crate::stats::ChannelStatsSnapshot;

/// State shared by every channel of a host.
#[derive(Debug, Clone)]
pub struct HostResources {
    pub registry: Arc<SyncptRegistry>,
    pub intr: Arc<Intr>,
    pub memory: Arc<MemoryManager>,
}

impl HostResources {
    pub fn new(syncpts: u32) -> Self {
        let registry = Arc::new(SyncptRegistry::new(syncpts));
        Self {
            intr: Arc::new(Intr::new(registry.clone())),
            registry,
            memory: Arc::new(MemoryManager::new()),
        }
    }
}

/// A host unit: the syncpoint registry, completion actions, buffers and channels.
#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    resources: HostResources,
    channels: Vec<Arc<Channel>>,
}

impl Host {
    /// Builds a host whose channels never execute anything on their own.
    pub fn new(config: HostConfig) -> std::result::Result<Self, HostError> {
        Self::with_hw(config, |_, _, _| Arc::new(NullCdmaHw::new()) as Arc<dyn CdmaHw>)
    }

    /// Builds a host, asking `make_hw` for each channel's register window.
    pub fn with_hw(
        config: HostConfig,
        make_hw: impl FnMut(u32, &ChannelConfig, &HostResources) -> Arc<dyn CdmaHw>,
    ) -> std::result::Result<Self, HostError> {
        config.validate()?;
        let resources = HostResources::new(config.syncpts);
        Self::with_resources(config, resources, make_hw)
    }

    /// Builds a host around existing `resources`, which are used as is: `config.syncpts`
    /// does not resize their registry.
    pub fn with_resources(
        config: HostConfig,
        resources: HostResources,
        mut make_hw: impl FnMut(u32, &ChannelConfig, &HostResources) -> Arc<dyn CdmaHw>,
    ) -> std::result::Result<Self, HostError> {
        config.validate()?;

        let mut channels = Vec::with_capacity(config.channels.len());
        for (id, channel) in config.channels.iter().enumerate() {
            let id = id as u32;
            let hw = make_hw(id, channel, &resources);
            let cdma = Cdma::new(
                channel.name.clone(),
                config.push_buffer_words,
                hw,
                resources.registry.clone(),
            )?;
            channels.push(Arc::new(Channel::new(ChannelInit {
                id,
                name: channel.name.clone(),
                class_id: channel.class_id,
                cdma: Arc::new(cdma),
                generation: config.generation,
                resources: resources.clone(),
                limits: config.limits(),
                wait_bases: config.wait_bases,
            })));
        }

        tracing::info!(
            syncpts = config.syncpts,
            channels = channels.len(),
            generation = ?config.generation,
            "host initialized"
        );
        Ok(Self {
            config,
            resources,
            channels,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn resources(&self) -> &HostResources {
        &self.resources
    }

    pub fn registry(&self) -> &Arc<SyncptRegistry> {
        &self.resources.registry
    }

    pub fn intr(&self) -> &Arc<Intr> {
        &self.resources.intr
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.resources.memory
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel(&self, id: u32) -> Result<&Arc<Channel>> {
        self.channels
            .get(id as usize)
            .ok_or(SubmitError::UnknownChannel(id))
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.name() == name)
    }

    pub fn submit(&self, channel_id: u32, job: Job) -> Result<SubmitReceipt> {
        self.channel(channel_id)?.submit(job)
    }

    pub fn submit_with(
        &self,
        channel_id: u32,
        job: Job,
        interrupt: &Interrupt,
    ) -> Result<SubmitReceipt> {
        self.channel(channel_id)?.submit_with(job, interrupt)
    }

    /// Blocks until syncpoint `id` reaches `thresh` or `timeout` elapses.
    pub fn wait(
        &self,
        id: u32,
        thresh: u32,
        timeout: Duration,
    ) -> std::result::Result<WaitOutcome, SyncptError> {
        self.resources.intr.wait(id, thresh, timeout)
    }

    /// Increments syncpoint `id` from the CPU and fires whatever became due. Returns the new
    /// current value.
    ///
    /// Client-managed syncpoints, and host-managed ones with nothing outstanding, get their
    /// `max` bumped first so the increment is never clamped away. On a host-managed syncpoint
    /// with submitted work outstanding the increment completes part of that work.
    pub fn cpu_incr(&self, id: u32) -> std::result::Result<u32, SyncptError> {
        let sp = self.resources.registry.get_client(id)?;
        sp.reserve_cpu_increment();
        self.resources.intr.increment(id, 1)?;
        Ok(sp.read_current())
    }

    /// Hardware-completion entry point: fires actions due at syncpoint `id`'s current value.
    pub fn syncpt_irq(&self, id: u32) -> usize {
        let current = match self.resources.registry.get(id) {
            Ok(sp) => sp.read_current(),
            Err(_) => {
                tracing::warn!(syncpt_id = id, "interrupt for unknown syncpoint");
                return 0;
            }
        };
        self.resources.intr.on_syncpoint_advanced(id, current)
    }

    /// Hands out a free syncpoint.
    pub fn alloc_syncpt(
        &self,
        name: &str,
        client_managed: bool,
    ) -> std::result::Result<u32, SyncptError> {
        Ok(self.resources.registry.assign(name, client_managed)?.id())
    }

    pub fn free_syncpt(&self, id: u32) -> std::result::Result<(), SyncptError> {
        self.resources.registry.release(id)
    }

    /// Waits until every channel has drained.
    pub fn flush(&self, timeout: Duration) -> std::result::Result<(), CdmaError> {
        for channel in &self.channels {
            channel.flush(timeout)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> BTreeMap<String, ChannelStatsSnapshot> {
        self.channels
            .iter()
            .map(|c| (c.name().to_owned(), c.stats().snapshot()))
            .collect()
    }

    /// Per-channel statistics as a JSON object keyed by channel name.
    pub fn stats_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.stats())
    }
}
