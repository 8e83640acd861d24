// 默认网络追踪：向系统请求"当前默认网络"，并在变化时更新共享状态
//
// 状态只由 apply 写入，保护监听器只读。

use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use crate::atoms::{Network, NetworkCallback, NetworkEvent, NetworkPlatform, NetworkRequestId};

#[derive(Default)]
pub struct DefaultNetworkState {
    current: RwLock<Option<Network>>,
}

impl DefaultNetworkState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> Option<Network> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, network: Option<Network>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = network;
    }
}

pub struct NetworkTracker {
    platform: Arc<dyn NetworkPlatform>,
    state: Arc<DefaultNetworkState>,
    request: Option<NetworkRequestId>,
}

impl NetworkTracker {
    // 平台不支持时返回 None，保护监听器将始终使用通用保护
    pub async fn start(
        platform: Arc<dyn NetworkPlatform>,
        state: Arc<DefaultNetworkState>,
    ) -> io::Result<Option<Self>> {
        if !platform.supports_default_network() {
            log::info!("平台不支持默认网络追踪，socket 保护将使用通用方式");
            return Ok(None);
        }

        let callback: NetworkCallback = {
            let platform = platform.clone();
            let state = state.clone();
            Arc::new(move |event: NetworkEvent| apply(platform.as_ref(), &state, event))
        };
        let request = platform.request_default_network(callback).await?;
        log::info!("已请求默认网络更新（{:?}）", request);

        Ok(Some(Self {
            platform,
            state,
            request: Some(request),
        }))
    }

    pub fn state(&self) -> &Arc<DefaultNetworkState> {
        &self.state
    }

    pub fn stop(&mut self) {
        if let Some(request) = self.request.take() {
            self.platform.unregister_network_request(request);
            self.state.set(None);
            log::info!("已取消默认网络追踪");
        }
    }
}

impl Drop for NetworkTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

// 所有状态写入的唯一入口
pub fn apply(platform: &dyn NetworkPlatform, state: &DefaultNetworkState, event: NetworkEvent) {
    let next = match event {
        NetworkEvent::Available(network) => {
            log::info!("默认网络可用：{}（{}）", network.interface, network.id);
            Some(network)
        }
        NetworkEvent::CapabilitiesChanged(network) => {
            log::debug!("默认网络属性变化：{}", network.interface);
            Some(network)
        }
        NetworkEvent::Lost(network) => {
            log::info!("默认网络丢失：{}", network.interface);
            None
        }
    };
    platform.set_underlying_network(next.as_ref());
    state.set(next);
}
