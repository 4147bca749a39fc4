//! Subject Classifier
//!
//! Picks the retrieval subject for a question when the caller did not
//! supply one. Scoring counts keyword occurrences per subject:
//!
//! ```text
//! "什么是正当防卫"  ──▶  刑法: 1 (正当防卫)  民法: 0  ...  ──▶  刑法
//! ```
//!
//! The highest count wins, ties go to the subject declared first, and a
//! question matching nothing falls back to [`Subject::DEFAULT`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Exam subject used to scope retrieval
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// 刑法
    #[serde(rename = "刑法")]
    CriminalLaw,
    /// 民法
    #[serde(rename = "民法")]
    CivilLaw,
    /// 刑事诉讼法
    #[serde(rename = "刑事诉讼法")]
    CriminalProcedure,
    /// 民事诉讼法
    #[serde(rename = "民事诉讼法")]
    CivilProcedure,
    /// 行政法
    #[serde(rename = "行政法")]
    AdministrativeLaw,
    /// 商经法
    #[serde(rename = "商经法")]
    CommercialEconomicLaw,
    /// 理论法
    #[serde(rename = "理论法")]
    Jurisprudence,
    /// 三国法
    #[serde(rename = "三国法")]
    InternationalLaw,
}

impl Subject {
    /// Declaration order; earlier subjects win ties
    pub const ALL: [Subject; 8] = [
        Subject::CriminalLaw,
        Subject::CivilLaw,
        Subject::CriminalProcedure,
        Subject::CivilProcedure,
        Subject::AdministrativeLaw,
        Subject::CommercialEconomicLaw,
        Subject::Jurisprudence,
        Subject::InternationalLaw,
    ];

    /// Subject chosen when no keyword matches
    pub const DEFAULT: Subject = Subject::CivilLaw;

    /// Display label
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::CriminalLaw => "刑法",
            Self::CivilLaw => "民法",
            Self::CriminalProcedure => "刑事诉讼法",
            Self::CivilProcedure => "民事诉讼法",
            Self::AdministrativeLaw => "行政法",
            Self::CommercialEconomicLaw => "商经法",
            Self::Jurisprudence => "理论法",
            Self::InternationalLaw => "三国法",
        }
    }

    /// Keywords that indicate this subject
    #[must_use]
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::CriminalLaw => &[
                "刑法", "犯罪", "正当防卫", "紧急避险", "故意", "过失", "共犯", "主犯",
                "从犯", "未遂", "中止", "既遂", "自首", "立功", "累犯", "缓刑", "量刑",
                "盗窃", "诈骗", "抢劫", "贪污", "受贿", "刑罚", "死刑",
            ],
            Self::CivilLaw => &[
                "民法", "合同", "物权", "债权", "侵权", "继承", "婚姻", "所有权",
                "抵押", "质押", "留置", "担保", "善意取得", "不当得利", "无因管理",
                "民事法律行为", "代理", "诉讼时效", "违约", "人格权",
            ],
            Self::CriminalProcedure => &[
                "刑事诉讼", "侦查", "起诉", "公诉", "自诉", "逮捕", "拘留", "取保候审",
                "监视居住", "辩护", "证据", "审查起诉", "死刑复核", "羁押",
            ],
            Self::CivilProcedure => &[
                "民事诉讼", "管辖", "起诉状", "反诉", "上诉", "再审", "执行", "仲裁",
                "调解", "举证责任", "诉讼代理", "财产保全", "先予执行", "支付令",
            ],
            Self::AdministrativeLaw => &[
                "行政", "行政许可", "行政处罚", "行政复议", "行政诉讼", "行政强制",
                "国家赔偿", "政府信息公开", "具体行政行为", "行政机关",
            ],
            Self::CommercialEconomicLaw => &[
                "公司", "股东", "合伙", "破产", "票据", "保险", "证券", "信托",
                "反垄断", "消费者权益", "税法", "劳动合同", "商标", "专利", "著作权",
            ],
            Self::Jurisprudence => &[
                "法理", "法律关系", "法律渊源", "法的效力", "法律解释", "宪法",
                "法治", "司法制度", "法律职业道德", "全国人大", "立法",
            ],
            Self::InternationalLaw => &[
                "国际法", "国际私法", "国际经济法", "条约", "领土", "外交", "引渡",
                "冲突规范", "准据法", "WTO", "反倾销", "国际贸易", "海洋法",
            ],
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error parsing a subject label
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subject: {0}")]
pub struct UnknownSubject(pub String);

impl FromStr for Subject {
    type Err = UnknownSubject;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|subject| subject.label() == s)
            .ok_or_else(|| UnknownSubject(s.to_string()))
    }
}

/// Number of keyword occurrences of `subject` in `text`
#[must_use]
pub fn score(subject: Subject, text: &str) -> usize {
    subject
        .keywords()
        .iter()
        .map(|keyword| text.matches(keyword).count())
        .sum()
}

/// Classify question text into a subject
#[must_use]
pub fn classify(text: &str) -> Subject {
    let mut best = (Subject::DEFAULT, 0);
    for subject in Subject::ALL {
        let count = score(subject, text);
        // Strictly greater keeps the earlier subject on ties
        if count > best.1 {
            best = (subject, count);
        }
    }
    best.0
}

/// Resolve the subject for a request: a known hint wins, otherwise classify
#[must_use]
pub fn resolve(hint: Option<&str>, text: &str) -> Subject {
    match hint.map(str::parse::<Subject>) {
        Some(Ok(subject)) => subject,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Ignoring subject hint, classifying instead");
            classify(text)
        }
        None => classify(text),
    }
}
