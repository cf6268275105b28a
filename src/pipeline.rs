// 🔁 Pipeline - preprocess → extract → aggregate → postprocess
//
// Levels run in traversal order (reversed for aggregates so composites see
// their members), callbacks in registration order. Every write is an upsert
// or a set-union, so any stage can be re-run or resumed.

use crate::aggregate;
use crate::db::ZoneStore;
use crate::enrichment::KnowledgeBase;
use crate::error::{GeozonesError, Result};
use crate::extract::{self, ExtractReport};
use crate::level::{Level, LevelRegistry, Processor, StageContext};
use crate::selection::{LevelSelection, StageFilter};
use crate::sources::{Dataset, Loaders, Source};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocess,
    Extract,
    Aggregate,
    Postprocess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preprocess => "preprocess",
            Stage::Extract => "extract",
            Stage::Aggregate => "aggregate",
            Stage::Postprocess => "postprocess",
        };
        f.write_str(name)
    }
}

/// Summary of one stage run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        StageReport {
            stage,
            processed: 0,
            skipped: 0,
            failed: 0,
        }
    }

    pub fn merge(&mut self, other: &StageReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    fn add_extraction(&mut self, report: ExtractReport) {
        self.processed += report.loaded;
        self.skipped += report.skipped;
        self.failed += report.failed;
    }

    fn log(&self) {
        if self.failed > 0 {
            warn!(
                "✗ {}: {} processed, {} skipped, {} failed",
                self.stage, self.processed, self.skipped, self.failed
            );
        } else {
            info!(
                "✓ {}: {} processed, {} skipped",
                self.stage, self.processed, self.skipped
            );
        }
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Runtime settings of a pipeline run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workdir: PathBuf,
    pub today: NaiveDate,
    pub chunk_size: usize,
    pub levels: LevelSelection,
}

pub struct Pipeline<'a> {
    registry: &'a LevelRegistry,
    store: &'a ZoneStore,
    knowledge_base: &'a dyn KnowledgeBase,
    loaders: Loaders,
    settings: RunSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        registry: &'a LevelRegistry,
        store: &'a ZoneStore,
        knowledge_base: &'a dyn KnowledgeBase,
        settings: RunSettings,
    ) -> Self {
        Pipeline {
            registry,
            store,
            knowledge_base,
            loaders: Loaders::default(),
            settings,
        }
    }

    fn context(&self, level: &'a Level) -> StageContext<'a> {
        StageContext {
            store: self.store,
            level,
            today: self.settings.today,
            knowledge_base: self.knowledge_base,
            chunk_size: self.settings.chunk_size,
        }
    }

    /// Selected levels in traversal order
    fn levels(&self, filter: &StageFilter) -> Vec<&'a Level> {
        self.registry
            .traverse()
            .into_iter()
            .filter(|level| self.settings.levels.allows(&level.id) && filter.allows_level(&level.id))
            .collect()
    }

    fn load(&self, level: &Level, source: &Source) -> Result<Dataset> {
        let path = self.settings.workdir.join(level.filename_for(source));
        if !path.exists() {
            return Err(GeozonesError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }
        self.loaders.load(&path, &source.options)
    }

    // ========================================================================
    // STAGES
    // ========================================================================

    pub fn preprocess(&self, filter: &StageFilter) -> Result<StageReport> {
        self.process(Stage::Preprocess, filter, |level| &level.preprocessors)
    }

    pub fn postprocess(&self, filter: &StageFilter) -> Result<StageReport> {
        self.process(Stage::Postprocess, filter, |level| &level.postprocessors)
    }

    fn process<F>(&self, stage: Stage, filter: &StageFilter, processors: F) -> Result<StageReport>
    where
        F: Fn(&'a Level) -> &'a Vec<Processor>,
    {
        let mut report = StageReport::new(stage);

        for level in self.levels(filter) {
            let ctx = self.context(level);
            for processor in processors(level) {
                if !filter.allows(&processor.name) {
                    report.skipped += 1;
                    continue;
                }
                info!("{} {} ({})", stage, processor.name, level.id);

                let rows = match &processor.source {
                    Some(source) => match self.load(level, source) {
                        Ok(dataset) => Some(dataset.into_rows()),
                        Err(e) => {
                            error!("Unable to load {} for {}: {}", source.url, processor.name, e);
                            report.failed += 1;
                            continue;
                        }
                    },
                    None => None,
                };

                match processor.run(&ctx, rows) {
                    Ok(processed) => report.processed += processed,
                    Err(e) => {
                        if let Some(violation) = e
                            .downcast_ref::<GeozonesError>()
                            .filter(|err| err.is_contract_violation())
                        {
                            return Err(GeozonesError::InvalidUsage(format!(
                                "{} failed: {}",
                                processor.name, violation
                            )));
                        }
                        error!("{} failed: {:#}", processor.name, e);
                        report.failed += 1;
                    }
                }
            }
        }

        report.log();
        Ok(report)
    }

    pub fn extract(&self, filter: &StageFilter) -> Result<StageReport> {
        let mut report = StageReport::new(Stage::Extract);

        for level in self.levels(filter) {
            for extractor in &level.extractors {
                if !filter.allows(&extractor.name) {
                    report.skipped += 1;
                    continue;
                }
                info!("Extracting {} with {}", level.id, extractor.name);

                let records = match self.load(level, &extractor.source) {
                    Ok(dataset) => dataset.into_records(),
                    Err(e) => {
                        error!("Unable to load {} for {}: {}", extractor.source.url, extractor.name, e);
                        report.failed += 1;
                        continue;
                    }
                };
                report.add_extraction(extract::process_dataset(self.store, &level.id, extractor, &records)?);
            }
        }

        report.log();
        Ok(report)
    }

    pub fn aggregate(&self, filter: &StageFilter) -> Result<StageReport> {
        let mut report = StageReport::new(Stage::Aggregate);

        for level in self.levels(filter).into_iter().rev() {
            if level.aggregates.is_empty() {
                continue;
            }
            let ctx = self.context(level);
            report.merge(&aggregate::build_aggregates(&ctx, filter)?);
        }

        report.log();
        Ok(report)
    }

    /// The four stages in order
    pub fn run(&self, filter: &StageFilter) -> Result<Vec<StageReport>> {
        Ok(vec![
            self.preprocess(filter)?,
            self.extract(filter)?,
            self.aggregate(filter)?,
            self.postprocess(filter)?,
        ])
    }
}
