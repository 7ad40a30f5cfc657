//! # レンダラーシーム
//!
//! 認証ゲート通過後のページ描画は外部コラボレータの責務であり、
//! この層は `Renderer` トレイトで境界のみを定義します。
//! 組み込みの `DashboardIndex` は設定内容を列挙する最小限の実装で、
//! 実ダッシュボードへの差し替えを前提としています。

use crate::config::AdminConfig;
use crate::transform::TransformRegistry;

/// 描画結果
pub struct RenderedPage {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// ページ描画の境界
///
/// ゲートが Allow を返したリクエストに対してのみ呼び出される
pub trait Renderer: Send + Sync {
    fn render(&self, config: &AdminConfig, registry: &TransformRegistry) -> RenderedPage;
}

/// 設定済みダッシュボードと接続先を列挙するプレーンテキストの索引
pub struct DashboardIndex;

impl Renderer for DashboardIndex {
    fn render(&self, config: &AdminConfig, registry: &TransformRegistry) -> RenderedPage {
        let mut body = String::with_capacity(512);

        body.push_str("cacheadmin\n==========\n\n");

        body.push_str("Dashboards:\n");
        for name in &config.dashboards {
            body.push_str("  - ");
            body.push_str(name);
            body.push('\n');
        }

        if !config.redis.is_empty() {
            body.push_str("\nRedis servers:\n");
            for server in &config.redis {
                body.push_str(&format!("  - {} ({}:{})\n", server.name, server.host, server.port));
            }
        }

        if !config.memcached.is_empty() {
            body.push_str("\nMemcached servers:\n");
            for server in &config.memcached {
                body.push_str(&format!("  - {} ({}:{})\n", server.name, server.host, server.port));
            }
        }

        body.push_str("\nValue transforms: ");
        let names: Vec<&str> = registry.transform_names().collect();
        body.push_str(&names.join(", "));
        body.push('\n');

        body.push_str(&format!(
            "Panel refresh: {}s / Metrics refresh: {}s / Timezone: {}\n",
            config.display.panelrefresh, config.display.metricsrefresh, config.display.timezone
        ));

        RenderedPage { content_type: "text/plain; charset=utf-8", body: body.into_bytes() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_lists_configured_items() {
        let config: AdminConfig = toml::from_str(
            r#"
            dashboards = ["server", "redis"]

            [[redis]]
            name = "Primary"
            host = "10.0.0.1"
            port = 6380
        "#,
        )
        .unwrap();
        let registry = TransformRegistry::with_defaults();

        let page = DashboardIndex.render(&config, &registry);
        let body = String::from_utf8(page.body).unwrap();

        assert_eq!(page.content_type, "text/plain; charset=utf-8");
        assert!(body.contains("- server"));
        assert!(body.contains("Primary (10.0.0.1:6380)"));
        assert!(body.contains("zlib, gzip, deflate, zlib-auto"));
    }
}
