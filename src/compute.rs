//! 计算派发
//!
//! 把三维索引空间切分成工作组任务投递到 Fabric 执行，
//! 接口与图形 API 的 compute dispatch 一致；
//! 没有 Fabric 时退化为当前线程上的同步迭代

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::fabric::{fabric_local, Fabric};
use crate::task::FabricTask;
use crate::worker::worker_block_on;

/// 三维尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ComputeDims {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl ComputeDims {
    /// 创建三维尺寸
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// 三个维度的乘积
    #[inline]
    pub fn product(&self) -> usize {
        self.x * self.y * self.z
    }

    /// 按维度向上取整除法
    fn ceil_div(&self, d: ComputeDims) -> ComputeDims {
        ComputeDims::new(
            ceil_div_axis(self.x, d.x),
            ceil_div_axis(self.y, d.y),
            ceil_div_axis(self.z, d.z),
        )
    }
}

#[inline]
fn ceil_div_axis(n: usize, d: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 + (n - 1) / d
    }
}

/// 单次计算调用的参数
///
/// 字段与图形 API compute dispatch 的内建变量一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComputeArgs {
    /// 局部工作组的尺寸
    pub workgroup_size: ComputeDims,
    /// 工作组的数量
    pub workgroup_num: ComputeDims,
    /// 当前工作组的索引
    pub workgroup_id: ComputeDims,
    /// 工作组内的局部索引
    pub local_invocation_id: ComputeDims,
    /// 全局索引（workgroup_id * workgroup_size + local_invocation_id）
    pub global_invocation_id: ComputeDims,
}

fn make_args(
    global: ComputeDims,
    local: ComputeDims,
    wg: ComputeDims,
    li: ComputeDims,
) -> ComputeArgs {
    ComputeArgs {
        workgroup_size: local,
        workgroup_num: global,
        workgroup_id: wg,
        local_invocation_id: li,
        global_invocation_id: ComputeDims::new(
            wg.x * local.x + li.x,
            wg.y * local.y + li.y,
            wg.z * local.z + li.z,
        ),
    }
}

thread_local! {
    /// 每次计算调用之间复位的暂存缓冲区
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// 访问当前线程的暂存缓冲区
///
/// 缓冲区在每次计算调用之间被清空（保留容量），
/// 计算函数可以把它当作本次调用专属的临时内存
pub fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    SCRATCH.with(|s| f(&mut s.borrow_mut()))
}

/// 清空暂存缓冲区（保留容量）
fn scratch_reset() {
    SCRATCH.with(|s| s.borrow_mut().clear());
}

/// 任务结束时递减剩余计数（任务 panic 时同样执行，等待方不会悬挂）
struct CountdownGuard(Arc<AtomicUsize>);

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 单线程迭代整个索引空间
///
/// z 为最外层，x 变化最快；size 限制全局索引（compute_sized 用）
fn compute_inline<F>(global: ComputeDims, local: ComputeDims, size: Option<ComputeDims>, f: &F)
where
    F: Fn(ComputeArgs),
{
    for gz in 0..global.z {
        for gy in 0..global.y {
            for gx in 0..global.x {
                for lz in 0..local.z {
                    for ly in 0..local.y {
                        for lx in 0..local.x {
                            let args = make_args(
                                global,
                                local,
                                ComputeDims::new(gx, gy, gz),
                                ComputeDims::new(lx, ly, lz),
                            );
                            if out_of_bounds(args.global_invocation_id, size) {
                                continue;
                            }
                            f(args);
                            scratch_reset();
                        }
                    }
                }
            }
        }
    }
}

#[inline]
fn out_of_bounds(id: ComputeDims, size: Option<ComputeDims>) -> bool {
    match size {
        Some(size) => id.x >= size.x || id.y >= size.y || id.z >= size.z,
        None => false,
    }
}

/// 多线程派发：每个外层工作组一个任务
///
/// 调用方以已声明阻塞的方式等待全部子任务完成
fn compute_fabric<F>(
    fabric: &Fabric,
    global: ComputeDims,
    local: ComputeDims,
    size: Option<ComputeDims>,
    f: F,
) where
    F: Fn(ComputeArgs) + Send + Sync + 'static,
{
    let groups = global.product();
    if groups == 0 {
        return;
    }
    let remaining = Arc::new(AtomicUsize::new(groups));
    let f = Arc::new(f);

    let mut tasks = Vec::with_capacity(groups);
    for gz in 0..global.z {
        for gy in 0..global.y {
            for gx in 0..global.x {
                let f = Arc::clone(&f);
                let remaining = Arc::clone(&remaining);
                let wg = ComputeDims::new(gx, gy, gz);
                tasks.push(FabricTask::compute(move || {
                    let _guard = CountdownGuard(remaining);
                    for lz in 0..local.z {
                        for ly in 0..local.y {
                            for lx in 0..local.x {
                                let args = make_args(
                                    global,
                                    local,
                                    wg,
                                    ComputeDims::new(lx, ly, lz),
                                );
                                if out_of_bounds(args.global_invocation_id, size) {
                                    continue;
                                }
                                f(args);
                                scratch_reset();
                            }
                        }
                    }
                }));
            }
        }
    }

    if fabric.task_batch_do(tasks).is_err() {
        panic!("cannot dispatch compute into a shut down fabric");
    }
    // 等待全部工作组完成
    worker_block_on(|| remaining.load(Ordering::Acquire) == 0);
}

/// 单线程按瓦片迭代
fn compute_tiled_inline<F>(grid: ComputeDims, tile: ComputeDims, f: &F)
where
    F: Fn(ComputeArgs),
{
    for gz in 0..grid.z {
        for gy in 0..grid.y {
            for gx in 0..grid.x {
                let args = tile_args(grid, tile, ComputeDims::new(gx, gy, gz));
                f(args);
                scratch_reset();
            }
        }
    }
}

/// 多线程按瓦片派发：每个瓦片一个任务
fn compute_tiled_fabric<F>(fabric: &Fabric, grid: ComputeDims, tile: ComputeDims, f: F)
where
    F: Fn(ComputeArgs) + Send + Sync + 'static,
{
    let groups = grid.product();
    if groups == 0 {
        return;
    }
    let remaining = Arc::new(AtomicUsize::new(groups));
    let f = Arc::new(f);

    let mut tasks = Vec::with_capacity(groups);
    for gz in 0..grid.z {
        for gy in 0..grid.y {
            for gx in 0..grid.x {
                let f = Arc::clone(&f);
                let remaining = Arc::clone(&remaining);
                let wg = ComputeDims::new(gx, gy, gz);
                tasks.push(FabricTask::compute(move || {
                    let _guard = CountdownGuard(remaining);
                    f(tile_args(grid, tile, wg));
                    scratch_reset();
                }));
            }
        }
    }

    if fabric.task_batch_do(tasks).is_err() {
        panic!("cannot dispatch compute into a shut down fabric");
    }
    worker_block_on(|| remaining.load(Ordering::Acquire) == 0);
}

/// 瓦片调用的参数：全局索引指向瓦片左下角
fn tile_args(grid: ComputeDims, tile: ComputeDims, wg: ComputeDims) -> ComputeArgs {
    ComputeArgs {
        workgroup_size: tile,
        workgroup_num: grid,
        workgroup_id: wg,
        local_invocation_id: ComputeDims::default(),
        global_invocation_id: ComputeDims::new(wg.x * tile.x, wg.y * tile.y, wg.z * tile.z),
    }
}

impl Fabric {
    /// 派发计算任务
    ///
    /// 执行 global * local 次调用，每个外层工作组一个任务；
    /// 返回时全部调用已完成。工作组之间的执行顺序没有保证
    pub fn compute<F>(&self, global: ComputeDims, local: ComputeDims, f: F)
    where
        F: Fn(ComputeArgs) + Send + Sync + 'static,
    {
        compute_fabric(self, global, local, None, f);
    }

    /// 按总尺寸派发计算任务
    ///
    /// 工作组数量按 total / local 向上取整推导，
    /// 全局索引超出 total 的调用被跳过，总调用次数恰为 prod(total)
    pub fn compute_sized<F>(&self, total: ComputeDims, local: ComputeDims, f: F)
    where
        F: Fn(ComputeArgs) + Send + Sync + 'static,
    {
        let global = total.ceil_div(local);
        compute_fabric(self, global, local, Some(total), f);
    }

    /// 按瓦片派发计算任务
    ///
    /// 每个瓦片只调用一次 f，由 f 自行迭代瓦片内部；
    /// 调用次数为 prod(ceil_div(total, tile))
    pub fn compute_tiled<F>(&self, total: ComputeDims, tile: ComputeDims, f: F)
    where
        F: Fn(ComputeArgs) + Send + Sync + 'static,
    {
        let grid = total.ceil_div(tile);
        compute_tiled_fabric(self, grid, tile, f);
    }
}

/// 使用本地 Fabric 派发计算
///
/// 没有本地 Fabric 时在当前线程同步执行（z 最外层，x 变化最快）
pub fn compute<F>(global: ComputeDims, local: ComputeDims, f: F)
where
    F: Fn(ComputeArgs) + Send + Sync + 'static,
{
    match fabric_local() {
        Some(fabric) => fabric.compute(global, local, f),
        None => compute_inline(global, local, None, &f),
    }
}

/// 使用本地 Fabric 按总尺寸派发计算
pub fn compute_sized<F>(total: ComputeDims, local: ComputeDims, f: F)
where
    F: Fn(ComputeArgs) + Send + Sync + 'static,
{
    match fabric_local() {
        Some(fabric) => fabric.compute_sized(total, local, f),
        None => {
            let global = total.ceil_div(local);
            compute_inline(global, local, Some(total), &f);
        }
    }
}

/// 使用本地 Fabric 按瓦片派发计算
pub fn compute_tiled<F>(total: ComputeDims, tile: ComputeDims, f: F)
where
    F: Fn(ComputeArgs) + Send + Sync + 'static,
{
    match fabric_local() {
        Some(fabric) => fabric.compute_tiled(total, tile, f),
        None => {
            let grid = total.ceil_div(tile);
            compute_tiled_inline(grid, tile, &f);
        }
    }
}
