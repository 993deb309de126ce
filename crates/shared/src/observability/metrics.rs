//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use super::ObservabilityConfig;
use crate::error::{Result, SharedError};

/// 排位晋升次数
pub const RANK_PROMOTIONS_TOTAL: &str = "rank_promotions_total";
/// 排位降级/移除次数
pub const RANK_DEMOTIONS_TOTAL: &str = "rank_demotions_total";
/// 名额不足导致的晋升失败次数
pub const RANK_CAPACITY_EXCEEDED_TOTAL: &str = "rank_capacity_exceeded_total";
/// 外部角色网关调用失败次数
pub const RANK_GATEWAY_FAILURES_TOTAL: &str = "rank_gateway_failures_total";
/// 对账修复的角色差异数
pub const RANK_RECONCILE_REPAIRS_TOTAL: &str = "rank_reconcile_repairs_total";

/// 初始化 Prometheus 指标导出
///
/// 在指定端口启动 HTTP 监听暴露 `/metrics` 端点，需要在 tokio 运行时内调用。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SharedError::Observability(e.to_string()))?;

    describe_metrics();
    metrics::counter!("service_starts_total", "service" => config.service_name.clone())
        .increment(1);

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// 注册指标描述
///
/// 这些描述会出现在 /metrics 端点的 HELP 注释中
pub fn describe_metrics() {
    metrics::describe_counter!(RANK_PROMOTIONS_TOTAL, "Total number of main rank promotions");
    metrics::describe_counter!(
        RANK_DEMOTIONS_TOTAL,
        "Total number of main rank removals caused by point loss"
    );
    metrics::describe_counter!(
        RANK_CAPACITY_EXCEEDED_TOTAL,
        "Total number of reservations rejected because the rank was full"
    );
    metrics::describe_counter!(
        RANK_GATEWAY_FAILURES_TOTAL,
        "Total number of failed external role mutations"
    );
    metrics::describe_counter!(
        RANK_RECONCILE_REPAIRS_TOTAL,
        "Total number of role drifts repaired by reconciliation"
    );
}
