//! Tunnel interface construction for a proxy endpoint

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use socktun_tun::{
    select_strategy, ExclusionTargets, InterfaceHandle, InterfaceSpec, RouteStrategy, RouteTable,
    SplitRoutes, TunPlatform,
};

use crate::config::TunnelConfig;
use crate::endpoint::ProxyEndpoint;
use crate::error::{Error, Result};

/// Name resolution used to find the proxy's address
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve `host` to its addresses
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's name service
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// An open interface plus what went into building it
#[derive(Debug)]
pub struct BuiltInterface {
    pub handle: InterfaceHandle,
    /// Proxy address kept off the tunnel; `None` when resolution failed
    pub proxy_addr: Option<Ipv4Addr>,
    /// Strategy that produced the installed route table
    pub strategy: &'static str,
}

/// Builds the tunnel interface for a proxy endpoint
pub struct TunnelInterfaceBuilder {
    platform: Arc<dyn TunPlatform>,
    resolver: Arc<dyn HostResolver>,
    settings: TunnelConfig,
}

impl TunnelInterfaceBuilder {
    pub fn new(platform: Arc<dyn TunPlatform>, settings: TunnelConfig) -> Self {
        Self {
            platform,
            resolver: Arc::new(SystemResolver),
            settings,
        }
    }

    /// Use a custom resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn settings(&self) -> &TunnelConfig {
        &self.settings
    }

    /// Resolve the proxy host to an IPv4 address
    ///
    /// Failure is not fatal: the caller routes everything and accepts the
    /// risk of the proxy connection looping through the tunnel.
    pub async fn resolve_proxy(&self, endpoint: &ProxyEndpoint) -> Option<Ipv4Addr> {
        if let Ok(addr) = endpoint.host.parse::<Ipv4Addr>() {
            return Some(addr);
        }

        match self.resolver.resolve(&endpoint.host, endpoint.port).await {
            Ok(addrs) => {
                let v4 = addrs.into_iter().find_map(|addr| match addr {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                });
                if v4.is_none() {
                    log::warn!("Proxy host {} has no IPv4 address", endpoint.host);
                }
                v4
            }
            Err(e) => {
                log::warn!("Failed to resolve proxy host {}: {}", endpoint.host, e);
                None
            }
        }
    }

    /// Describe the interface for a route table
    pub fn interface_spec(&self, routes: RouteTable) -> Result<InterfaceSpec> {
        let mut builder = InterfaceSpec::builder()
            .session_name(self.settings.session_name.clone())
            .address(self.settings.address, 32)
            .mtu(self.settings.mtu)
            .routes(routes)
            .exclude_self(self.settings.exclude_self);
        if let Some(ref name) = self.settings.name {
            builder = builder.name(name.clone());
        }
        builder
            .build()
            .map_err(|e| Error::InterfaceCreation(e.to_string()))
    }

    /// Open the tunnel interface for `endpoint`
    ///
    /// The interface is opened last; nothing is left open on error. A
    /// platform that rejects the exclusion primitive gets the split route
    /// table instead.
    pub async fn build(&self, endpoint: &ProxyEndpoint) -> Result<BuiltInterface> {
        let proxy_addr = self.resolve_proxy(endpoint).await;
        if proxy_addr.is_none() {
            log::warn!(
                "Proxy {} not resolved, its traffic may loop through the tunnel",
                endpoint.server_address()
            );
        }

        let targets = ExclusionTargets {
            proxy: proxy_addr,
            bypass: self.settings.bypass_dns,
        };

        let strategy = select_strategy(self.platform.supports_route_exclusion());
        let spec = self.interface_spec(strategy.plan(&targets))?;
        log::debug!(
            "Using {} routes: {} captured, {} excluded",
            strategy.name(),
            spec.routes.routes.len(),
            spec.routes.excluded.len()
        );

        match self.platform.establish(&spec).await {
            Ok(handle) => Ok(BuiltInterface {
                handle,
                proxy_addr,
                strategy: strategy.name(),
            }),
            Err(e) if e.is_not_supported() && spec.routes.has_exclusions() => {
                log::info!("Route exclusion unavailable ({}), falling back to split routes", e);
                let fallback = SplitRoutes;
                let spec = self.interface_spec(fallback.plan(&targets))?;
                let handle = self.platform.establish(&spec).await?;
                Ok(BuiltInterface {
                    handle,
                    proxy_addr,
                    strategy: fallback.name(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use socktun_tun::{InterfaceResource, TunFd};

    struct NoopResource;

    #[async_trait]
    impl InterfaceResource for NoopResource {
        async fn close(&mut self) -> socktun_tun::Result<()> {
            Ok(())
        }
    }

    struct RecordingPlatform {
        exclusion: bool,
        refuse_exclusions: bool,
        deny: bool,
        specs: Mutex<Vec<InterfaceSpec>>,
    }

    impl RecordingPlatform {
        fn new(exclusion: bool) -> Self {
            Self {
                exclusion,
                refuse_exclusions: false,
                deny: false,
                specs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TunPlatform for RecordingPlatform {
        fn supports_route_exclusion(&self) -> bool {
            self.exclusion
        }

        async fn establish(&self, spec: &InterfaceSpec) -> socktun_tun::Result<InterfaceHandle> {
            if self.deny {
                return Err(socktun_tun::Error::PermissionDenied("user declined".into()));
            }
            if self.refuse_exclusions && spec.routes.has_exclusions() {
                return Err(socktun_tun::Error::NotSupported("no exclusions".into()));
            }
            self.specs.lock().unwrap().push(spec.clone());
            let fd: TunFd = 42;
            Ok(InterfaceHandle::new(fd, "test0", spec.mtu, Box::new(NoopResource)))
        }
    }

    struct StaticResolver(Option<IpAddr>);

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            match self.0 {
                Some(addr) => Ok(vec![addr]),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", host),
                )),
            }
        }
    }

    const PROXY: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);

    fn builder(platform: Arc<RecordingPlatform>, resolved: Option<IpAddr>) -> TunnelInterfaceBuilder {
        TunnelInterfaceBuilder::new(platform, TunnelConfig::default())
            .with_resolver(Arc::new(StaticResolver(resolved)))
    }

    #[tokio::test]
    async fn test_exclusion_strategy() {
        let platform = Arc::new(RecordingPlatform::new(true));
        let builder = builder(platform.clone(), Some(IpAddr::V4(PROXY)));
        let endpoint = ProxyEndpoint::new("proxy.example.com", 1080).unwrap();

        let built = builder.build(&endpoint).await.unwrap();
        assert_eq!(built.proxy_addr, Some(PROXY));
        assert_eq!(built.strategy, "exclude");
        assert_eq!(built.handle.mtu(), 1500);
        built.handle.close().await.unwrap();

        let specs = platform.specs.lock().unwrap();
        let spec = &specs[0];
        assert_eq!(spec.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(spec.prefix_len, 32);
        assert!(spec.exclude_self);
        assert!(!spec.routes.captures(PROXY));
        assert!(!spec.routes.captures(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(spec.routes.captures(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[tokio::test]
    async fn test_split_strategy_without_exclusion() {
        let platform = Arc::new(RecordingPlatform::new(false));
        let builder = builder(platform.clone(), None);
        let endpoint = ProxyEndpoint::new("203.0.113.5", 1080).unwrap();

        let built = builder.build(&endpoint).await.unwrap();
        assert_eq!(built.strategy, "split");
        built.handle.close().await.unwrap();

        let specs = platform.specs.lock().unwrap();
        assert_eq!(specs[0].routes.routes.len(), 32);
        assert!(!specs[0].routes.captures(PROXY));
    }

    #[tokio::test]
    async fn test_fallback_when_exclusion_refused() {
        let mut platform = RecordingPlatform::new(true);
        platform.refuse_exclusions = true;
        let platform = Arc::new(platform);
        let builder = builder(platform.clone(), Some(IpAddr::V4(PROXY)));
        let endpoint = ProxyEndpoint::new("proxy.example.com", 1080).unwrap();

        let built = builder.build(&endpoint).await.unwrap();
        assert_eq!(built.strategy, "split");
        built.handle.close().await.unwrap();

        let specs = platform.specs.lock().unwrap();
        assert_eq!(specs.len(), 1);
        assert!(!specs[0].routes.has_exclusions());
        assert!(!specs[0].routes.captures(PROXY));
    }

    #[tokio::test]
    async fn test_unresolved_proxy_routes_everything() {
        let platform = Arc::new(RecordingPlatform::new(false));
        let builder = builder(platform.clone(), None);
        let endpoint = ProxyEndpoint::new("unknown.invalid", 1080).unwrap();

        let built = builder.build(&endpoint).await.unwrap();
        assert_eq!(built.proxy_addr, None);
        built.handle.close().await.unwrap();

        let specs = platform.specs.lock().unwrap();
        assert_eq!(specs[0].routes, RouteTable::route_all());
    }

    #[tokio::test]
    async fn test_ipv6_only_proxy_is_unresolved() {
        let platform = Arc::new(RecordingPlatform::new(true));
        let builder = builder(platform, Some("2001:db8::1".parse().unwrap()));
        let endpoint = ProxyEndpoint::new("v6.example.com", 1080).unwrap();
        assert_eq!(builder.resolve_proxy(&endpoint).await, None);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let mut platform = RecordingPlatform::new(true);
        platform.deny = true;
        let builder = builder(Arc::new(platform), Some(IpAddr::V4(PROXY)));
        let endpoint = ProxyEndpoint::new("proxy.example.com", 1080).unwrap();

        let err = builder.build(&endpoint).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }
}
