//! Harvest orchestration: walking the course tree and feeding the pipeline.
//!
//! The [`Harvester`] owns the single-threaded crawl loop. Discovery of the
//! tree itself (site navigation, DOM parsing, login automation) lives behind
//! the [`Discovery`] trait; this crate ships [`ManifestDiscovery`], which
//! serves a JSON course manifest. Transfers run fully asynchronously
//! relative to the walk: the loop only suspends at its periodic
//! [`TransferManager::drain`] barriers.
//!
//! # Resume semantics
//!
//! A lesson is marked done in the [`ProgressLedger`] and the cursor is
//! persisted immediately after its materials are submitted, before the
//! periodic drain confirms the transfers. A crash in that window can leave a
//! lesson marked done with missing or truncated files; a later run
//! resubmits a file only if its destination is absent. This ordering is
//! deliberate and load-bearing for restart cost: do not move the persist
//! behind the drain without revisiting the drain cadence.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::ledger::ProgressLedger;
use crate::store::ObjectStore;
use crate::transfer::{DrainReport, TransferCounters, TransferManager, TransferRequest};

/// File written into a lesson directory when the lesson carries a subtitle.
pub const TOPICS_FILE_NAME: &str = "lesson_topics.txt";

/// Default drain cadence: barrier every this many lessons.
pub const DEFAULT_DRAIN_EVERY: usize = 5;

/// Errors from the discovery collaborator.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The course manifest could not be read.
    #[error("failed to read manifest {path}: {source}")]
    ManifestIo {
        /// Manifest path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The course manifest is not valid.
    #[error("malformed manifest {path}: {source}")]
    ManifestParse {
        /// Manifest path.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Discovery needs a manual login but there is no display to do it on.
    #[error("interactive login required but headless mode is active")]
    HeadlessLogin,

    /// The remote site misbehaved during discovery.
    #[error("discovery failed: {reason}")]
    Site {
        /// What went wrong.
        reason: String,
    },
}

/// A course in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRef {
    /// Course title; used as the directory and folder name.
    pub title: String,
    /// Course page locator.
    pub url: String,
}

/// A lesson within a course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRef {
    /// Lesson title; used as the directory name and in composite keys.
    pub title: String,
    /// Optional subtitle describing the lesson's topics.
    pub subtitle: Option<String>,
    /// Lesson page locator.
    pub url: String,
}

/// One downloadable material within a lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Material {
    /// Source URL.
    pub url: String,
    /// File name to store the material under.
    pub file_name: String,
    /// Referrer to send; defaults to the lesson page when absent.
    pub referer: Option<String>,
}

/// Produces the course → lesson → material tree.
///
/// Sequences are finite per invocation and not restartable mid-walk;
/// restart semantics are entirely the ledger's job. Implementations that
/// need a manual login must fail [`Discovery::prepare`] with
/// [`DiscoveryError::HeadlessLogin`] when `headless` is set.
#[async_trait]
pub trait Discovery: Send {
    /// One-time setup (login waits, session warmup). Default: nothing.
    async fn prepare(
        &mut self,
        _login_wait: Duration,
        _headless: bool,
    ) -> Result<(), DiscoveryError> {
        Ok(())
    }

    /// Ordered list of courses.
    async fn courses(&mut self) -> Result<Vec<CourseRef>, DiscoveryError>;

    /// Ordered list of lessons for a course.
    async fn lessons(&mut self, course: &CourseRef) -> Result<Vec<LessonRef>, DiscoveryError>;

    /// Materials for a lesson; may be empty.
    async fn materials(
        &mut self,
        course: &CourseRef,
        lesson: &LessonRef,
    ) -> Result<Vec<Material>, DiscoveryError>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    courses: Vec<ManifestCourse>,
}

#[derive(Debug, Deserialize)]
struct ManifestCourse {
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    lessons: Vec<ManifestLesson>,
}

#[derive(Debug, Deserialize)]
struct ManifestLesson {
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    materials: Vec<ManifestMaterial>,
}

#[derive(Debug, Deserialize)]
struct ManifestMaterial {
    url: String,
    file_name: String,
    #[serde(default)]
    referer: Option<String>,
}

/// Discovery backed by a JSON course manifest.
///
/// The manifest is the already-discovered tree; this implementation never
/// touches the network, so `prepare` succeeds in headless mode.
#[derive(Debug)]
pub struct ManifestDiscovery {
    manifest: Manifest,
}

impl ManifestDiscovery {
    /// Loads a manifest from disk.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::ManifestIo`] /
    /// [`DiscoveryError::ManifestParse`] when the file is missing or
    /// malformed. Both are setup-fatal for the caller.
    #[instrument]
    pub fn from_path(path: &std::path::Path) -> Result<Self, DiscoveryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| DiscoveryError::ManifestIo {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest =
            serde_json::from_str(&raw).map_err(|source| DiscoveryError::ManifestParse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { manifest })
    }

    fn course(&self, title: &str) -> Option<&ManifestCourse> {
        self.manifest.courses.iter().find(|c| c.title == title)
    }
}

#[async_trait]
impl Discovery for ManifestDiscovery {
    async fn courses(&mut self) -> Result<Vec<CourseRef>, DiscoveryError> {
        Ok(self
            .manifest
            .courses
            .iter()
            .map(|c| CourseRef {
                title: c.title.clone(),
                url: c.url.clone(),
            })
            .collect())
    }

    async fn lessons(&mut self, course: &CourseRef) -> Result<Vec<LessonRef>, DiscoveryError> {
        let Some(found) = self.course(&course.title) else {
            return Ok(Vec::new());
        };
        Ok(found
            .lessons
            .iter()
            .map(|l| LessonRef {
                title: l.title.clone(),
                subtitle: l.subtitle.clone().filter(|s| !s.is_empty()),
                url: l.url.clone(),
            })
            .collect())
    }

    async fn materials(
        &mut self,
        course: &CourseRef,
        lesson: &LessonRef,
    ) -> Result<Vec<Material>, DiscoveryError> {
        let Some(found) = self
            .course(&course.title)
            .and_then(|c| c.lessons.iter().find(|l| l.title == lesson.title))
        else {
            return Ok(Vec::new());
        };

        let lesson_referer = (!found.url.is_empty()).then(|| found.url.clone());
        Ok(found
            .materials
            .iter()
            .map(|m| Material {
                url: m.url.clone(),
                file_name: m.file_name.clone(),
                referer: m.referer.clone().or_else(|| lesson_referer.clone()),
            })
            .collect())
    }
}

/// Knobs for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Root download directory.
    pub download_dir: PathBuf,
    /// Lessons between periodic drains (1 in sequential mode).
    pub drain_every: usize,
    /// Per-item timeout applied at every drain.
    pub item_timeout: Duration,
    /// Manual-login wait handed to discovery.
    pub login_wait: Duration,
    /// Whether the run has no display for interactive steps.
    pub headless: bool,
    /// Remote folder name to mirror completed courses into, when set.
    pub mirror_folder: Option<String>,
}

/// Aggregate result of a harvest run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final counter snapshot.
    pub counters: TransferCounters,
    /// Every failed destination, in drain order.
    pub failures: Vec<String>,
    /// Whether an operator interrupt cut the walk short.
    pub interrupted: bool,
}

/// The orchestration loop. Owns the ledger; shares the manager with the
/// progress UI.
#[derive(Debug)]
pub struct Harvester {
    manager: Arc<TransferManager>,
    store: Option<Arc<ObjectStore>>,
    ledger: ProgressLedger,
    ledger_path: PathBuf,
    options: HarvestOptions,
    interrupt: Arc<AtomicBool>,
}

impl Harvester {
    /// Creates a harvester over a manager and a loaded (or reset) ledger.
    #[must_use]
    pub fn new(manager: Arc<TransferManager>, ledger: ProgressLedger, options: HarvestOptions) -> Self {
        let ledger_path = ProgressLedger::path_in(&options.download_dir);
        Self {
            manager,
            store: None,
            ledger,
            ledger_path,
            options,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attaches the remote store used by the mirror pass.
    #[must_use]
    pub fn with_store(mut self, store: Arc<ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Flag that requests an orderly stop at the next lesson boundary.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Walks the tree, submitting transfers and committing progress.
    ///
    /// Per-item failures are contained by the manager and only surface in
    /// the returned report. Discovery failures on individual courses degrade
    /// to skipping the course.
    ///
    /// # Errors
    ///
    /// Only setup-time discovery failures propagate:
    /// [`Discovery::prepare`] errors (e.g. [`DiscoveryError::HeadlessLogin`]).
    #[instrument(skip(self, discovery))]
    pub async fn run(&mut self, discovery: &mut dyn Discovery) -> Result<RunReport, DiscoveryError> {
        discovery
            .prepare(self.options.login_wait, self.options.headless)
            .await?;

        let courses = match discovery.courses().await {
            Ok(courses) => courses,
            Err(e) => {
                error!(error = %e, "could not list courses");
                Vec::new()
            }
        };

        if courses.is_empty() {
            warn!("no courses found");
        } else {
            info!(courses = courses.len(), "starting harvest");
        }

        let start_course = self.ledger.course_index;
        let mut start_lesson = self.ledger.lesson_index;
        let mut failures = Vec::new();
        let mut interrupted = false;

        'courses: for (i, course) in courses.iter().enumerate() {
            if i < start_course {
                continue;
            }
            if self.interrupt.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }

            info!(
                course = %course.title,
                position = i + 1,
                total = courses.len(),
                "processing course"
            );

            let lessons = match discovery.lessons(course).await {
                Ok(lessons) => lessons,
                Err(e) => {
                    warn!(course = %course.title, error = %e, "could not list lessons, skipping course");
                    continue;
                }
            };

            if lessons.is_empty() {
                warn!(course = %course.title, "no lessons available");
                continue;
            }

            for (j, lesson) in lessons.iter().enumerate() {
                if i == start_course && j < start_lesson {
                    continue;
                }
                if self.interrupt.load(Ordering::SeqCst) {
                    interrupted = true;
                    break 'courses;
                }

                let key = ProgressLedger::composite_key(&course.title, &lesson.title);
                if self.ledger.is_done(&key) {
                    debug!(lesson = %lesson.title, "already completed, skipping");
                    continue;
                }

                info!(
                    lesson = %lesson.title,
                    position = j + 1,
                    total = lessons.len(),
                    "gathering lesson"
                );
                self.gather_lesson(discovery, course, lesson).await;

                // Commit the cursor now, before the periodic drain below;
                // see the module docs for the crash window this opens.
                self.ledger.mark_done(key);
                if let Err(e) = self.ledger.advance_and_persist(i, j + 1, &self.ledger_path) {
                    warn!(error = %e, "could not persist progress");
                }

                let drain_every = self.options.drain_every.max(1);
                if self.manager.counters().total > 0 && j % drain_every == 0 {
                    let report = self.manager.drain(self.options.item_timeout).await;
                    note_drain(&report, &mut failures);
                }
            }

            start_lesson = 0;

            let report = self.manager.drain(self.options.item_timeout).await;
            note_drain(&report, &mut failures);

            if let Some(folder) = self.options.mirror_folder.clone() {
                self.mirror_course(course, &folder).await;
                let report = self.manager.drain(self.options.item_timeout).await;
                note_drain(&report, &mut failures);
            }
        }

        if interrupted {
            warn!("interrupted by operator; progress saved, resuming run will continue here");
        }

        let final_report = self.manager.shutdown(self.options.item_timeout).await;
        note_drain(&final_report, &mut failures);

        info!(
            completed = final_report.counters.completed,
            failed = final_report.counters.failed,
            total = final_report.counters.total,
            "harvest finished"
        );

        Ok(RunReport {
            counters: final_report.counters,
            failures,
            interrupted,
        })
    }

    /// Prepares the lesson directory and submits its material transfers.
    /// Directory or discovery failures degrade to skipping the lesson.
    async fn gather_lesson(
        &self,
        discovery: &mut dyn Discovery,
        course: &CourseRef,
        lesson: &LessonRef,
    ) {
        let lesson_dir = self
            .options
            .download_dir
            .join(&course.title)
            .join(&lesson.title);

        if let Err(e) = tokio::fs::create_dir_all(&lesson_dir).await {
            error!(dir = %lesson_dir.display(), error = %e, "could not create lesson directory");
            return;
        }

        if let Some(subtitle) = &lesson.subtitle {
            let topics_path = lesson_dir.join(TOPICS_FILE_NAME);
            if !topics_path.exists() {
                if let Err(e) = tokio::fs::write(&topics_path, subtitle).await {
                    debug!(path = %topics_path.display(), error = %e, "could not write topics note");
                }
            }
        }

        let materials = match discovery.materials(course, lesson).await {
            Ok(materials) => materials,
            Err(e) => {
                warn!(lesson = %lesson.title, error = %e, "could not list materials");
                return;
            }
        };

        if materials.is_empty() {
            debug!(lesson = %lesson.title, "no materials");
            return;
        }

        info!(lesson = %lesson.title, materials = materials.len(), "submitting transfers");
        for material in materials {
            self.manager.submit(TransferRequest::Download {
                dest: lesson_dir.join(&material.file_name),
                url: material.url,
                referer: material.referer,
            });
        }
    }

    /// Submits uploads for every file already harvested under the course
    /// directory. The store's duplicate check keeps repeat passes cheap.
    async fn mirror_course(&self, course: &CourseRef, folder_name: &str) {
        let Some(store) = &self.store else {
            warn!("mirror requested but no remote store is configured");
            return;
        };

        let root_id = match store.ensure_folder(folder_name, None).await {
            Ok(id) => id,
            Err(e) => {
                warn!(folder = folder_name, error = %e, "could not prepare mirror root");
                return;
            }
        };
        let course_id = match store.ensure_folder(&course.title, Some(&root_id)).await {
            Ok(id) => id,
            Err(e) => {
                warn!(course = %course.title, error = %e, "could not prepare course folder");
                return;
            }
        };

        let course_dir = self.options.download_dir.join(&course.title);
        let mut lesson_dirs = match tokio::fs::read_dir(&course_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %course_dir.display(), error = %e, "nothing to mirror");
                return;
            }
        };

        while let Ok(Some(lesson_entry)) = lesson_dirs.next_entry().await {
            let lesson_path = lesson_entry.path();
            if !lesson_path.is_dir() {
                continue;
            }
            let lesson_name = lesson_entry.file_name().to_string_lossy().into_owned();

            let lesson_folder_id = match store.ensure_folder(&lesson_name, Some(&course_id)).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(lesson = %lesson_name, error = %e, "could not prepare lesson folder");
                    continue;
                }
            };

            let mut files = match tokio::fs::read_dir(&lesson_path).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %lesson_path.display(), error = %e, "could not list lesson files");
                    continue;
                }
            };

            while let Ok(Some(file_entry)) = files.next_entry().await {
                let file_path = file_entry.path();
                if !file_path.is_file() {
                    continue;
                }
                self.manager.submit(TransferRequest::Upload {
                    local: file_path,
                    folder_id: lesson_folder_id.clone(),
                });
            }
        }
    }
}

/// Accumulates drain failures for the final report.
fn note_drain(report: &DrainReport, failures: &mut Vec<String>) {
    failures.extend(report.failures.iter().cloned());
}

/// Arms an operator-interrupt watcher that flips `flag` on Ctrl-C.
///
/// The harvest loop checks the flag at lesson boundaries and then performs
/// its normal drain-then-persist shutdown, so an interrupt never loses
/// committed progress.
pub fn spawn_interrupt_watcher(flag: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current lesson, then draining");
            flag.store(true, Ordering::SeqCst);
        }
    })
}
