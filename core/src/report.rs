use serde::Serialize;

use crate::tracker::FeatureStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Whole percent, rounded half up.
    pub pass_rate: u32,
    pub passed_features: Vec<String>,
    pub failed_features: Vec<String>,
    pub manual_tasks: usize,
}

impl ResultReport {
    pub fn from_statuses(statuses: &[FeatureStatus], manual_tasks: usize) -> Self {
        let (passed_features, failed_features): (Vec<&FeatureStatus>, Vec<&FeatureStatus>) =
            statuses.iter().partition(|status| status.is_passed);
        let total = statuses.len();
        let passed = passed_features.len();
        Self {
            total,
            passed,
            failed: failed_features.len(),
            pass_rate: pass_rate(passed, total),
            passed_features: passed_features.iter().map(|s| s.name.clone()).collect(),
            failed_features: failed_features.iter().map(|s| s.name.clone()).collect(),
            manual_tasks,
        }
    }

    pub fn render(&self) -> String {
        let mut report = String::from("📊 **MCP Feature Test Results**\n\n");

        if self.manual_tasks > 0 {
            report.push_str("🚨 **⚠️ Test Result Reliability Warning ⚠️**\n\n");
            report.push_str(&format!(
                "This test contains {} manual test cases. **The accuracy of test results may be affected by user operations**.\n",
                self.manual_tasks
            ));
            report.push_str("Please carefully read the manual test case descriptions to understand factors that may affect test accuracy.\n\n");
        }

        report.push_str("**Summary:**\n");
        report.push_str(&format!("• Total Features: {}\n", self.total));
        report.push_str(&format!("• ✅ Passed: {}\n", self.passed));
        report.push_str(&format!("• ❌ Failed: {}\n", self.failed));
        report.push_str(&format!("• 📈 Pass Rate: {}%\n\n", self.pass_rate));

        if !self.passed_features.is_empty() {
            report.push_str("**Passed Features:**\n");
            for name in &self.passed_features {
                report.push_str(&format!("• ✅ {name}\n"));
            }
            report.push('\n');
        }
        if !self.failed_features.is_empty() {
            report.push_str("**Failed Features:**\n");
            for name in &self.failed_features {
                report.push_str(&format!("• ❌ {name}\n"));
            }
        }
        report
    }
}

fn pass_rate(passed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((passed as f64 / total as f64) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(passed: usize, failed: usize) -> Vec<FeatureStatus> {
        (0..passed)
            .map(|i| FeatureStatus {
                name: format!("passed/{i}"),
                is_passed: true,
            })
            .chain((0..failed).map(|i| FeatureStatus {
                name: format!("failed/{i}"),
                is_passed: false,
            }))
            .collect()
    }

    #[test]
    fn counts_add_up_and_rate_rounds() {
        let report = ResultReport::from_statuses(&statuses(1, 2), 0);
        assert_eq!(report.total, 3);
        assert_eq!(report.passed + report.failed, report.total);
        assert_eq!(report.pass_rate, 33);

        assert_eq!(ResultReport::from_statuses(&statuses(2, 1), 0).pass_rate, 67);
        assert_eq!(ResultReport::from_statuses(&statuses(1, 7), 0).pass_rate, 13);
        assert_eq!(ResultReport::from_statuses(&statuses(25, 0), 0).pass_rate, 100);
    }

    #[test]
    fn empty_table_reports_zero() {
        let report = ResultReport::from_statuses(&[], 0);
        assert_eq!(report.total, 0);
        assert_eq!(report.pass_rate, 0);
    }

    #[test]
    fn render_warns_about_manual_tasks() {
        let report = ResultReport::from_statuses(&statuses(1, 1), 9);
        let text = report.render();
        assert!(text.contains("9 manual test cases"));
        assert!(text.contains("Pass Rate: 50%"));
        assert!(text.contains("✅ passed/0"));
        assert!(text.contains("❌ failed/0"));

        let quiet = ResultReport::from_statuses(&statuses(1, 1), 0).render();
        assert!(!quiet.contains("Reliability Warning"));
    }
}
