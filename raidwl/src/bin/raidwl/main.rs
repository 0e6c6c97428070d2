// vim: tw=80
//! Exercise a RAM-backed parity RAID group from the command line.

use std::{ops::Range, path::PathBuf, sync::Arc};

use clap::{crate_version, Parser};
use raidwl_core::{
    block,
    config::GroupConfig,
    engine::{StatsSnapshot, WriteEngine},
    geometry::RaidGeometry,
    mem_drive::MemDrives,
    memory::PageSize,
    monitor::{GroupMonitor, RedundancyMonitor},
    planner::{Algorithm, ResourcePlan},
    transport::DriveTransport,
    write_log::FlushReport,
    BlockCountT,
    Error,
    LbaT,
    PosBitmap,
    PosT,
    Result,
    Status,
};
use serde_derive::Serialize;
use tracing_subscriber::EnvFilter;

/// Group options shared by every subcommand
#[derive(Parser, Clone, Debug)]
struct GroupArgs {
    /// YAML group configuration.  Without one, a 5-wide RAID-5 group with
    /// default settings is used.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Positions that are dead from the start
    #[clap(short, long, value_delimiter(','))]
    dead: Vec<PosT>,
}

/// A freshly initialized group of RAM drives
struct Group {
    cfg: GroupConfig,
    drives: Arc<MemDrives>,
    monitor: Arc<RedundancyMonitor>,
}

impl GroupArgs {
    async fn build(&self) -> Result<Group> {
        let cfg = match &self.config {
            Some(path) => GroupConfig::load(path)?,
            None => GroupConfig::new(5, 1),
        };
        let drives = Arc::new(MemDrives::new(RaidGeometry::new(&cfg)?));
        let monitor = Arc::new(RedundancyMonitor::new(cfg.parity));
        for pos in self.dead.iter() {
            if *pos >= cfg.width {
                eprintln!("Error: no position {pos} in a {}-wide group",
                          cfg.width);
                return Err(Error::InvalidConfig);
            }
            drives.kill(*pos);
            monitor.continue_request(PosBitmap::single(*pos)).await;
        }
        Ok(Group{cfg, drives, monitor})
    }
}

impl Group {
    fn engine(&self) -> Result<WriteEngine> {
        let transport: Arc<dyn DriveTransport> = self.drives.clone();
        let monitor: Arc<dyn GroupMonitor> = self.monitor.clone();
        WriteEngine::new(&self.cfg, transport, monitor)
    }
}

fn print_yaml<T: serde::Serialize>(v: &T) -> Result<()> {
    print!("{}", serde_yaml_ng::to_string(v)?);
    Ok(())
}

#[derive(Serialize)]
struct PlanSummary {
    algorithm: Algorithm,
    parity_range: Range<LbaT>,
    reads: usize,
    secondary_reads: usize,
    writes: usize,
    read_blocks: BlockCountT,
    write_blocks: BlockCountT,
    header_blocks: BlockCountT,
    page_size: PageSize,
    page_count: u32,
}

impl From<&ResourcePlan> for PlanSummary {
    fn from(p: &ResourcePlan) -> Self {
        PlanSummary {
            algorithm: p.algorithm,
            parity_range: p.parity_range.clone(),
            reads: p.reads.len(),
            secondary_reads: p.reads2.len(),
            writes: p.writes.len(),
            read_blocks: p.read_blocks(),
            write_blocks: p.write_blocks(),
            header_blocks: p.header_blocks,
            page_size: p.page_size,
            page_count: p.page_count,
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Show how a host write would be planned, without doing any I/O
struct Plan {
    #[clap(flatten)]
    group: GroupArgs,
    /// First host LBA
    lba: LbaT,
    /// Number of blocks
    blocks: BlockCountT,
}

impl Plan {
    async fn main(self) -> Result<()> {
        let engine = self.group.build().await?.engine()?;
        let plans = engine.plan(self.lba, self.blocks)?;
        let summary = plans.iter().map(PlanSummary::from).collect::<Vec<_>>();
        print_yaml(&summary)
    }
}

#[derive(Serialize)]
struct WriteOutput {
    status: Status,
    stats: StatsSnapshot,
}

#[derive(Parser, Clone, Debug)]
/// Write a pattern to the group and report what it took
struct Write {
    #[clap(flatten)]
    group: GroupArgs,
    /// Byte to fill every data block with
    #[clap(short, long, default_value = "165")]
    fill: u8,
    /// First host LBA
    lba: LbaT,
    /// Number of blocks
    blocks: BlockCountT,
}

impl Write {
    async fn main(self) -> Result<()> {
        let engine = self.group.build().await?.engine()?;
        let data = block::host_blocks(self.blocks as usize, self.fill);
        let status = engine.write(self.lba, &data).await?;
        print_yaml(&WriteOutput{status, stats: engine.stats()})
    }
}

#[derive(Serialize)]
struct FlushOutput {
    write_status: Status,
    slots: Vec<FlushReport>,
    stats: StatsSnapshot,
}

#[derive(Parser, Clone, Debug)]
/// Write, lose power partway through, then recover the write log
struct Flush {
    #[clap(flatten)]
    group: GroupArgs,
    /// Number of drive writes that land before power is lost.  By default
    /// every write lands.
    #[clap(long)]
    crash_after: Option<u32>,
    #[clap(short, long, default_value = "165")]
    fill: u8,
    /// First host LBA
    lba: LbaT,
    /// Number of blocks
    blocks: BlockCountT,
}

impl Flush {
    async fn main(self) -> Result<()> {
        let group = self.group.build().await?;
        if let Some(n) = self.crash_after {
            group.drives.freeze_writes_after(n);
        }
        let write_status = {
            let engine = group.engine()?;
            let data = block::host_blocks(self.blocks as usize, self.fill);
            engine.write(self.lba, &data).await?
        };
        group.drives.power_cycle();
        tracing::info!("group restarted");
        let engine = group.engine()?;
        let slots = engine.flush_all().await?;
        print_yaml(&FlushOutput{write_status, slots, stats: engine.stats()})
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Flush(Flush),
    Plan(Plan),
    Write(Write),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Flush(flush) => flush.main().await,
        SubCommand::Plan(plan) => plan.main().await,
        SubCommand::Write(write) => write.main().await,
    }
}
