// ==========================================
// 配送调度核心 - 地理聚类 (GeoClusterer)
// ==========================================
// 职责: 将 pending 订单按送达点划分为空间聚类
// 输入: LedgerSnapshot（已按公平排序,下标即排位）
// 输出: Vec<Cluster>,按最早成员排位升序
// ==========================================
// 红线: 订单按排位顺序追加入簇,不会因更早的订单被挤出
// 红线: 坐标非法的订单跳过并告警,保持 pending
// 边界订单: 最近两个质心距离差不超过 overlap_distance_km 时,
//           选成员平均排位更小（更早）的聚类
// ==========================================

use crate::config::dispatch_config::ClusteringConfig;
use crate::domain::geo::centroid;
use crate::domain::{Cluster, ClusteringMethod, GeoPoint, Order};
use crate::engine::ledger::LedgerSnapshot;
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ==========================================
// ClusterBuilder - 单次聚类内的可变聚类
// ==========================================
#[derive(Debug, Clone)]
struct ClusterBuilder {
    anchor: GeoPoint,          // 用于距离判定的中心
    members: Vec<(usize, String, GeoPoint)>, // (rank, order_id, point)
    lat_sum: f64,
    lon_sum: f64,
    running_centroid: bool,    // true = 每次追加后更新 anchor
}

impl ClusterBuilder {
    fn seeded(anchor: GeoPoint, running_centroid: bool) -> Self {
        Self {
            anchor,
            members: Vec::new(),
            lat_sum: 0.0,
            lon_sum: 0.0,
            running_centroid,
        }
    }

    fn push(&mut self, rank: usize, order_id: &str, point: GeoPoint) {
        self.members.push((rank, order_id.to_string(), point));
        self.lat_sum += point.lat;
        self.lon_sum += point.lon;
        if self.running_centroid {
            let n = self.members.len() as f64;
            self.anchor = GeoPoint::new(self.lat_sum / n, self.lon_sum / n);
        }
    }

    fn average_rank(&self) -> f64 {
        if self.members.is_empty() {
            return f64::MAX;
        }
        self.members.iter().map(|(r, _, _)| *r as f64).sum::<f64>() / self.members.len() as f64
    }

    fn is_full(&self, max_size: Option<usize>) -> bool {
        max_size.is_some_and(|max| self.members.len() >= max)
    }
}

// ==========================================
// GeoClusterer
// ==========================================
pub struct GeoClusterer {
    config: ClusteringConfig,
}

impl GeoClusterer {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// 对快照中的 pending 订单聚类
    ///
    /// # 参数
    /// - snapshot: 台账快照
    /// - pass_id: 派单轮次 id（用于生成确定性的 cluster_id）
    ///
    /// # 返回
    /// 少于 min_orders_per_pass 个有效订单时返回空集
    pub fn cluster_pending(&self, snapshot: &LedgerSnapshot, pass_id: &str) -> Vec<Cluster> {
        let points = self.valid_points(&snapshot.pending);
        if points.is_empty() || points.len() < self.config.min_orders_per_pass {
            tracing::debug!(
                valid = points.len(),
                min = self.config.min_orders_per_pass,
                "有效订单不足，跳过聚类"
            );
            return Vec::new();
        }

        let builders = match self.config.method {
            ClusteringMethod::ThresholdRadius => self.threshold_radius(&points),
            ClusteringMethod::KMeans => self.k_means(&points),
            ClusteringMethod::Grid => self.grid(&points),
        };

        let clusters = finalize(builders, pass_id, snapshot);
        tracing::info!(
            method = self.config.method.as_str(),
            orders = points.len(),
            clusters = clusters.len(),
            "聚类完成"
        );
        clusters
    }

    /// (rank, order_id, 送达点),跳过坐标非法的订单
    fn valid_points<'a>(&self, pending: &'a [Order]) -> Vec<(usize, &'a str, GeoPoint)> {
        pending
            .iter()
            .enumerate()
            .filter_map(|(rank, order)| {
                if order.has_valid_coordinates() {
                    Some((rank, order.order_id.as_str(), order.destination))
                } else {
                    tracing::warn!(order_id = %order.order_id, "订单坐标非法，本轮不参与聚类");
                    None
                }
            })
            .collect()
    }

    /// 在候选聚类中选择落点
    ///
    /// candidates: (builder 下标, 距离),已排除满员聚类
    fn pick(&self, mut candidates: Vec<(usize, f64)>, builders: &[ClusterBuilder]) -> Option<usize> {
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        let first = *candidates.first()?;
        if let Some(second) = candidates.get(1) {
            if (second.1 - first.1).abs() <= self.config.overlap_distance_km {
                let avg_first = builders[first.0].average_rank();
                let avg_second = builders[second.0].average_rank();
                if avg_second < avg_first {
                    return Some(second.0);
                }
            }
        }
        Some(first.0)
    }

    // ==========================================
    // threshold_radius: 贪心领队分组
    // ==========================================
    fn threshold_radius(&self, points: &[(usize, &str, GeoPoint)]) -> Vec<ClusterBuilder> {
        let mut builders: Vec<ClusterBuilder> = Vec::new();
        for (rank, order_id, point) in points {
            let candidates: Vec<(usize, f64)> = builders
                .iter()
                .enumerate()
                .filter(|(_, b)| !b.is_full(self.config.max_cluster_size))
                .map(|(i, b)| (i, b.anchor.distance_km(point)))
                .filter(|(_, d)| *d <= self.config.proximity_threshold_km)
                .collect();

            match self.pick(candidates, &builders) {
                Some(idx) => builders[idx].push(*rank, order_id, *point),
                None => {
                    let mut builder = ClusterBuilder::seeded(*point, true);
                    builder.push(*rank, order_id, *point);
                    builders.push(builder);
                }
            }
        }
        builders
    }

    // ==========================================
    // k_means: 确定性 Lloyd 迭代
    // ==========================================
    fn k_means(&self, points: &[(usize, &str, GeoPoint)]) -> Vec<ClusterBuilder> {
        // 以最早的 k 个互异点作为初始质心
        let mut centroids: Vec<GeoPoint> = Vec::new();
        for (_, _, p) in points {
            if centroids.len() >= self.config.num_clusters {
                break;
            }
            if !centroids.iter().any(|c| c == p) {
                centroids.push(*p);
            }
        }
        if centroids.is_empty() {
            return self.threshold_radius(points);
        }

        for iteration in 0..self.config.kmeans_max_iterations {
            let mut groups: Vec<Vec<GeoPoint>> = vec![Vec::new(); centroids.len()];
            for (_, _, p) in points {
                groups[nearest(&centroids, p)].push(*p);
            }
            let next: Vec<GeoPoint> = groups
                .iter()
                .zip(centroids.iter())
                .map(|(g, c)| centroid(g).unwrap_or(*c))
                .collect();
            if next == centroids {
                tracing::trace!(iteration, "k-means 已收敛");
                break;
            }
            centroids = next;
        }

        // 最终成员按排位顺序追加
        let mut builders: Vec<ClusterBuilder> = centroids
            .iter()
            .map(|c| ClusterBuilder::seeded(*c, false))
            .collect();
        for (rank, order_id, point) in points {
            let candidates: Vec<(usize, f64)> = builders
                .iter()
                .enumerate()
                .filter(|(_, b)| !b.is_full(self.config.max_cluster_size))
                .map(|(i, b)| (i, b.anchor.distance_km(point)))
                .collect();
            match self.pick(candidates, &builders) {
                Some(idx) => builders[idx].push(*rank, order_id, *point),
                None => {
                    // 全部满员: 以该点开新簇
                    let mut builder = ClusterBuilder::seeded(*point, false);
                    builder.push(*rank, order_id, *point);
                    builders.push(builder);
                }
            }
        }
        builders
    }

    // ==========================================
    // grid: 经纬度网格分箱
    // ==========================================
    fn grid(&self, points: &[(usize, &str, GeoPoint)]) -> Vec<ClusterBuilder> {
        let cell = self.config.grid_cell_deg;
        let mut cells: BTreeMap<(i64, i64), Vec<ClusterBuilder>> = BTreeMap::new();
        for (rank, order_id, point) in points {
            let key = (
                (point.lat / cell).floor() as i64,
                (point.lon / cell).floor() as i64,
            );
            let slots = cells.entry(key).or_default();
            let need_new = slots
                .last()
                .map_or(true, |b| b.is_full(self.config.max_cluster_size));
            if need_new {
                slots.push(ClusterBuilder::seeded(*point, true));
            }
            if let Some(builder) = slots.last_mut() {
                builder.push(*rank, order_id, *point);
            }
        }
        cells.into_values().flatten().collect()
    }
}

/// 最近质心下标（距离相同取下标小者）
fn nearest(centroids: &[GeoPoint], p: &GeoPoint) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.distance_km(p)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// 生成最终聚类: 丢弃空簇,按最早成员排位排序并编号
fn finalize(builders: Vec<ClusterBuilder>, pass_id: &str, snapshot: &LedgerSnapshot) -> Vec<Cluster> {
    let mut built: Vec<ClusterBuilder> = builders.into_iter().filter(|b| !b.members.is_empty()).collect();
    built.sort_by_key(|b| b.members[0].0);

    built
        .into_iter()
        .enumerate()
        .map(|(idx, b)| {
            let member_points: Vec<GeoPoint> = b.members.iter().map(|(_, _, p)| *p).collect();
            let center = centroid(&member_points).unwrap_or(b.anchor);
            let radius_km = member_points
                .iter()
                .map(|p| center.distance_km(p))
                .fold(0.0, f64::max);
            Cluster {
                cluster_id: format!("{}-C{:03}", pass_id, idx + 1),
                pass_id: pass_id.to_string(),
                centroid: center,
                radius_km,
                oldest_rank: b.members[0].0,
                average_rank: b.average_rank(),
                member_ids: b.members.into_iter().map(|(_, id, _)| id).collect(),
                created_at: snapshot.taken_at,
            }
        })
        .collect()
}
