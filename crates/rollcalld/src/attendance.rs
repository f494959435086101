//! Photo submission → recognition → ledger, plus query and export.
//!
//! Extraction and matching run without touching storage locks; only the
//! final ledger append goes through the single storage writer.

use crate::extraction::{extract_faces, ExtractionError};
use chrono::{NaiveDate, NaiveTime, Timelike};
use rollcall_core::{
    export_filename, render_csv, BoundingBox, CosineMatcher, DetectedFace, Embedding, ExportError,
    ExportPolicy, ExtractError, FaceExtractor, MatchError, Matcher, StudentId,
};
use rollcall_store::{AttendanceLedger, EmbeddingStore, StoreError, StudentDirectory};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("extraction: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("matching: {0}")]
    Match(#[from] MatchError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("export: {0}")]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentStudent {
    pub student_id: StudentId,
    pub student_name: String,
    pub score: f32,
    /// Where the best-matching face for this student was found.
    pub region: Option<BoundingBox>,
}

/// Outcome of one submitted photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReport {
    pub course: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub faces: usize,
    pub newly_present: Vec<PresentStudent>,
    pub already_present: Vec<StudentId>,
    pub unmatched: usize,
}

/// Ledger row joined with the student's display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub id: String,
    pub student_id: StudentId,
    pub student_name: String,
    pub course: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: &'static str,
}

#[derive(Clone)]
pub struct AttendanceService {
    extractor: Arc<dyn FaceExtractor>,
    matcher: CosineMatcher,
    embeddings: EmbeddingStore,
    ledger: AttendanceLedger,
    students: StudentDirectory,
    threshold: f32,
    extract_timeout: Duration,
    export_policy: ExportPolicy,
}

impl AttendanceService {
    pub fn new(
        extractor: Arc<dyn FaceExtractor>,
        embeddings: EmbeddingStore,
        ledger: AttendanceLedger,
        students: StudentDirectory,
        threshold: f32,
        extract_timeout: Duration,
        export_policy: ExportPolicy,
    ) -> Self {
        Self {
            extractor,
            matcher: CosineMatcher,
            embeddings,
            ledger,
            students,
            threshold,
            extract_timeout,
            export_policy,
        }
    }

    /// Recognize every face in `image` and mark the matched students present.
    ///
    /// `time` defaults to the current local time. A photo with no faces or no
    /// matches is not an error; it reports zero inserted.
    pub async fn submit_photo(
        &self,
        course: &str,
        date: NaiveDate,
        time: Option<NaiveTime>,
        image: Vec<u8>,
    ) -> Result<CaptureReport, AttendanceError> {
        let course = course.trim();
        if course.is_empty() {
            return Err(AttendanceError::InvalidArgument("course is required".into()));
        }
        if image.is_empty() {
            return Err(AttendanceError::InvalidArgument("image is empty".into()));
        }
        let time = time.unwrap_or_else(|| chrono::Local::now().time());
        let time = time.with_nanosecond(0).unwrap_or(time);

        let faces: Vec<DetectedFace> =
            match extract_faces(&self.extractor, image, self.extract_timeout).await {
                Ok(faces) => faces,
                Err(ExtractionError::Extract(ExtractError::NoFace)) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
        let probes: Vec<Embedding> = faces.iter().map(|f| f.embedding.clone()).collect();

        let galleries = self.embeddings.all_galleries().await?;
        let results = self.matcher.match_probes(&probes, &galleries, self.threshold)?;
        let summary = self
            .ledger
            .recognize_and_record(course, date, time, &results)
            .await?;

        let names = self.students.names().await?;
        let newly_present = summary
            .newly_present
            .iter()
            .map(|record| {
                let best = results
                    .iter()
                    .filter(|r| r.student_id() == Some(record.student_id.as_str()))
                    .max_by(|a, b| a.score.total_cmp(&b.score));
                PresentStudent {
                    student_id: record.student_id.clone(),
                    student_name: names.get(&record.student_id).cloned().unwrap_or_default(),
                    score: best.map_or(0.0, |r| r.score),
                    region: best.and_then(|r| faces.get(r.probe)).map(|f| f.region.clone()),
                }
            })
            .collect();

        tracing::debug!(course, %date, %time, faces = probes.len(), "photo processed");

        Ok(CaptureReport {
            course: course.to_string(),
            date,
            time,
            faces: probes.len(),
            newly_present,
            already_present: summary.already_present,
            unmatched: summary.unmatched,
        })
    }

    pub async fn query(
        &self,
        course: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRow>, AttendanceError> {
        let records = self.ledger.query(course, date).await?;
        let names = self.students.names().await?;
        Ok(records
            .into_iter()
            .map(|r| AttendanceRow {
                student_name: names.get(&r.student_id).cloned().unwrap_or_default(),
                id: r.id,
                student_id: r.student_id,
                course: r.course,
                date: r.date,
                time: r.time,
                status: r.status.as_str(),
            })
            .collect())
    }

    /// Roster members with no record for the session. An empty roster means
    /// every registered student.
    pub async fn absentees(
        &self,
        course: &str,
        date: NaiveDate,
        roster: Vec<StudentId>,
    ) -> Result<Vec<StudentId>, AttendanceError> {
        let roster = if roster.is_empty() {
            self.students
                .list()
                .await?
                .into_iter()
                .map(|s| s.student_id)
                .collect()
        } else {
            roster
        };
        Ok(self.ledger.absentees(course, date, &roster).await?)
    }

    /// CSV export for one class session, with its conventional filename.
    pub async fn export(
        &self,
        course: &str,
        date: NaiveDate,
    ) -> Result<(String, Vec<u8>), AttendanceError> {
        let records = self.ledger.query(course, date).await?;
        let names = self.students.names().await?;
        let bytes = render_csv(&records, &names, self.export_policy)?;
        tracing::info!(course, %date, rows = records.len(), "attendance exported");
        Ok((export_filename(course, date), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::HistogramExtractor;
    use rollcall_store::Database;

    /// Each `;`-separated group in the image is one face, `x,y` floats.
    struct StubExtractor;

    impl FaceExtractor for StubExtractor {
        fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractError> {
            let text = std::str::from_utf8(image).map_err(|e| ExtractError::Decode(e.to_string()))?;
            if text == "noface" {
                return Err(ExtractError::NoFace);
            }
            if text == "corrupt" {
                return Err(ExtractError::Decode("corrupt".into()));
            }
            text.split(';')
                .filter(|g| !g.is_empty())
                .enumerate()
                .map(|(index, group)| {
                    let values = group
                        .split(',')
                        .map(|v| v.parse::<f32>().map_err(|e| ExtractError::Decode(e.to_string())))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(DetectedFace {
                        region: BoundingBox {
                            x: 100.0 * index as f32,
                            y: 0.0,
                            width: 80.0,
                            height: 80.0,
                            confidence: 1.0,
                        },
                        embedding: Embedding::new(values),
                    })
                })
                .collect()
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    async fn service_with(
        extractor: Arc<dyn FaceExtractor>,
        dim: usize,
        policy: ExportPolicy,
    ) -> (AttendanceService, EmbeddingStore, StudentDirectory) {
        let db = Database::open_in_memory().await.unwrap();
        let students = StudentDirectory::new(db.clone());
        let embeddings = EmbeddingStore::new(db.clone(), dim);
        let service = AttendanceService::new(
            extractor,
            embeddings.clone(),
            AttendanceLedger::new(db),
            students.clone(),
            0.9,
            Duration::from_secs(5),
            policy,
        );
        (service, embeddings, students)
    }

    async fn service() -> AttendanceService {
        let (service, embeddings, students) =
            service_with(Arc::new(StubExtractor), 2, ExportPolicy::default()).await;
        students.add("S1", "Smith, John", "john@u.edu").await.unwrap();
        students.add("S2", "Emma Wilson", "emma@u.edu").await.unwrap();
        embeddings.enroll("S1", &[Embedding::new(vec![1.0, 0.0])]).await.unwrap();
        embeddings.enroll("S2", &[Embedding::new(vec![0.0, 1.0])]).await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_photo_marks_matched_students() {
        let service = service().await;
        let report = service
            .submit_photo("CS101", d("2025-01-10"), Some(t("09:00:00")), b"1,0.05;0,1;-1,0".to_vec())
            .await
            .unwrap();

        assert_eq!(report.faces, 3);
        let ids: Vec<_> = report.newly_present.iter().map(|p| p.student_id.as_str()).collect();
        assert_eq!(ids, ["S1", "S2"]);
        assert_eq!(report.newly_present[0].student_name, "Smith, John");
        assert!(report.newly_present[0].score > 0.99);
        let regions: Vec<_> = report
            .newly_present
            .iter()
            .map(|p| p.region.as_ref().map(|r| r.x))
            .collect();
        assert_eq!(regions, [Some(0.0), Some(100.0)]);
        assert!(report.already_present.is_empty());
        assert_eq!(report.unmatched, 1);
    }

    #[tokio::test]
    async fn test_concurrent_photos_record_student_once() {
        let service = service().await;
        let submit = |svc: AttendanceService| async move {
            svc.submit_photo("CS101", d("2025-01-10"), Some(t("09:00:00")), b"1,0".to_vec())
                .await
                .unwrap()
        };
        let (a, b) = tokio::join!(
            tokio::spawn(submit(service.clone())),
            tokio::spawn(submit(service.clone()))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let inserted = a.newly_present.len() + b.newly_present.len();
        let already: Vec<_> = a.already_present.iter().chain(&b.already_present).collect();
        assert_eq!(inserted, 1);
        assert_eq!(already, [&"S1".to_string()]);

        let rows = service.query("CS101", d("2025-01-10")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].student_id, "S1");
        assert_eq!(rows[0].student_name, "Smith, John");
    }

    #[tokio::test]
    async fn test_photo_without_faces_is_not_an_error() {
        let service = service().await;
        let report = service
            .submit_photo("CS101", d("2025-01-10"), None, b"noface".to_vec())
            .await
            .unwrap();
        assert_eq!(report.faces, 0);
        assert!(report.newly_present.is_empty());
        assert_eq!(report.unmatched, 0);
    }

    #[tokio::test]
    async fn test_empty_gallery_reports_all_unmatched() {
        let (service, _, _) =
            service_with(Arc::new(StubExtractor), 2, ExportPolicy::default()).await;
        let report = service
            .submit_photo("CS101", d("2025-01-10"), None, b"1,0;0,1".to_vec())
            .await
            .unwrap();
        assert!(report.newly_present.is_empty());
        assert_eq!(report.unmatched, 2);
    }

    #[tokio::test]
    async fn test_undecodable_photo_is_surfaced() {
        let service = service().await;
        let err = service
            .submit_photo("CS101", d("2025-01-10"), None, b"corrupt".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_blank_course_rejected() {
        let service = service().await;
        let err = service
            .submit_photo("  ", d("2025-01-10"), None, b"1,0".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_absentees_default_to_registered_students() {
        let service = service().await;
        service
            .submit_photo("CS101", d("2025-01-10"), None, b"0,1".to_vec())
            .await
            .unwrap();

        let absent = service.absentees("CS101", d("2025-01-10"), vec![]).await.unwrap();
        assert_eq!(absent, ["S1"]);
        let absent = service
            .absentees("CS101", d("2025-01-10"), vec!["S2".into(), "S9".into()])
            .await
            .unwrap();
        assert_eq!(absent, ["S9"]);
    }

    #[tokio::test]
    async fn test_export_uses_filename_convention_and_quotes_names() {
        let service = service().await;
        service
            .submit_photo("CS101", d("2025-01-10"), Some(t("09:00:00")), b"1,0".to_vec())
            .await
            .unwrap();

        let (filename, bytes) = service.export("CS101", d("2025-01-10")).await.unwrap();
        assert_eq!(filename, "attendance_CS101_2025-01-10.csv");
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "Student Name,Student ID,Course,Date,Time,Status\r\n\
             \"Smith, John\",S1,CS101,2025-01-10,09:00:00,present\r\n"
        );
    }

    #[tokio::test]
    async fn test_empty_export_follows_policy() {
        let (lenient, _, _) =
            service_with(Arc::new(StubExtractor), 2, ExportPolicy::default()).await;
        let (_, bytes) = lenient.export("CS101", d("2025-01-10")).await.unwrap();
        assert!(!bytes.is_empty());

        let (strict, _, _) =
            service_with(Arc::new(StubExtractor), 2, ExportPolicy { reject_empty: true }).await;
        let err = strict.export("CS101", d("2025-01-10")).await.unwrap_err();
        assert!(matches!(err, AttendanceError::Export(ExportError::EmptyExport)));
    }

    #[tokio::test]
    async fn test_histogram_extractor_end_to_end() {
        use image::{GrayImage, ImageFormat, Luma};
        use std::io::Cursor;

        fn png(img: &GrayImage) -> Vec<u8> {
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, ImageFormat::Png).unwrap();
            buf.into_inner()
        }

        let extractor: Arc<dyn FaceExtractor> = Arc::new(HistogramExtractor);
        let (service, embeddings, students) =
            service_with(extractor.clone(), extractor.dimensions(), ExportPolicy::default()).await;
        students.add("S1", "John Smith", "john@u.edu").await.unwrap();

        let face = GrayImage::from_fn(120, 120, |x, y| Luma([((x * 2 + y) % 256) as u8]));
        let enrolled = extractor.extract(&png(&face)).unwrap();
        embeddings.enroll("S1", &[enrolled[0].embedding.clone()]).await.unwrap();

        let report = service
            .submit_photo("CS101", d("2025-01-10"), None, png(&face))
            .await
            .unwrap();
        assert_eq!(report.newly_present.len(), 1);
        assert_eq!(report.newly_present[0].student_id, "S1");
    }
}
