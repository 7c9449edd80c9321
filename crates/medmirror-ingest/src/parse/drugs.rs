// Drug record parsers
//
// Three bulk distributions feed the drug domain:
// - structured product labels (openFDA JSON, nested `openfda` block)
// - the NDC product directory (tab-delimited rows)
// - the Orange Book product table (`~`-delimited rows)
//
// All three produce `DrugRecord` drafts keyed by normalized generic name,
// falling back to the brand name when no generic name is present.

use super::extract::{Extractor, FieldPath};
use super::{completeness, RecordOutcome, RecordParser, SkipReason};
use crate::merge::identity::drug_key;
use crate::models::{CanonicalRecord, DrugRecord, Formulation, RawDraftRecord, Source};
use serde_json::Value;
use std::collections::BTreeMap;

use FieldPath::{Pointer, Split};

fn draft(source: Source, drug: DrugRecord, index: usize, ext: Extractor<'_>) -> RecordOutcome {
    RecordOutcome::Parsed {
        draft: RawDraftRecord {
            source,
            identity_key: drug.generic_name.clone(),
            fields: CanonicalRecord::Drug(drug),
            record_index: index,
        },
        dropped_fields: ext.into_dropped(),
    }
}

/// Resolve the identity key from generic then brand candidates
fn identity(generic: &[String], brands: &[String]) -> Option<String> {
    generic
        .iter()
        .chain(brands.iter())
        .find_map(|name| drug_key(name))
}

// ============================================================================
// Structured product labels
// ============================================================================

const LABEL_GENERIC: &[FieldPath] = &[
    Pointer("/openfda/generic_name"),
    Pointer("/generic_name"),
    Pointer("/openfda/substance_name"),
];
const LABEL_BRAND: &[FieldPath] = &[Pointer("/openfda/brand_name"), Pointer("/brand_name")];
const LABEL_MANUFACTURER: &[FieldPath] = &[
    Pointer("/openfda/manufacturer_name"),
    Pointer("/manufacturer_name"),
];
const LABEL_INGREDIENTS: &[FieldPath] = &[
    Pointer("/openfda/substance_name"),
    Pointer("/active_ingredient_names"),
];
const LABEL_ROUTES: &[FieldPath] = &[Pointer("/openfda/route"), Pointer("/route")];
const LABEL_CLASS: &[FieldPath] = &[
    Pointer("/openfda/pharm_class_epc"),
    Pointer("/pharm_class_epc"),
    Pointer("/openfda/pharm_class_moa"),
];
const LABEL_MECHANISM: &[FieldPath] = &[
    Pointer("/mechanism_of_action"),
    Pointer("/clinical_pharmacology"),
];
const LABEL_INDICATIONS: &[FieldPath] = &[Pointer("/indications_and_usage"), Pointer("/purpose")];
const LABEL_CONTRAINDICATIONS: &[FieldPath] = &[Pointer("/contraindications"), Pointer("/do_not_use")];
const LABEL_WARNINGS: &[FieldPath] = &[
    Pointer("/warnings_and_cautions"),
    Pointer("/warnings"),
    Pointer("/boxed_warning"),
];
const LABEL_DOSAGE: &[FieldPath] = &[Pointer("/dosage_and_administration"), Pointer("/directions")];
const LABEL_INTERACTIONS: &[FieldPath] = &[Pointer("/drug_interactions")];
const LABEL_NDCS: &[FieldPath] = &[Pointer("/openfda/product_ndc"), Pointer("/product_ndc")];
const LABEL_APPLICATION: &[FieldPath] = &[Pointer("/openfda/application_number")];

pub struct LabelParser;

impl RecordParser for LabelParser {
    fn source(&self) -> Source {
        Source::DrugLabels
    }

    fn parse_record(&self, record: &Value, index: usize) -> RecordOutcome {
        if !record.is_object() {
            return RecordOutcome::Skipped(SkipReason::NotAnObject);
        }

        let mut ext = Extractor::new(record);
        let generic = ext.list("generic_name", LABEL_GENERIC);
        let brand_names = ext.list("brand_names", LABEL_BRAND);
        let Some(key) = identity(&generic, &brand_names) else {
            return RecordOutcome::Skipped(SkipReason::MissingIdentity);
        };

        let routes = ext.list("routes", LABEL_ROUTES);
        let application_number = ext.list("application_number", LABEL_APPLICATION).into_iter().next();
        let first_brand = brand_names.first().cloned();
        let formulations: Vec<Formulation> = ext
            .list("formulations", LABEL_NDCS)
            .into_iter()
            .map(|ndc| Formulation {
                ndc: Some(ndc),
                brand_name: first_brand.clone(),
                route: routes.first().cloned(),
                application_number: application_number.clone(),
                ..Default::default()
            })
            .collect();

        let mut interactions = BTreeMap::new();
        if let Some(text) = ext.text("interactions", LABEL_INTERACTIONS) {
            interactions.insert(Source::DrugLabels.as_str().to_string(), text);
        }

        let mut drug = DrugRecord {
            generic_name: key,
            brand_names,
            manufacturers: ext.list("manufacturers", LABEL_MANUFACTURER),
            active_ingredients: ext.list("active_ingredients", LABEL_INGREDIENTS),
            routes,
            therapeutic_class: ext.text("therapeutic_class", LABEL_CLASS),
            mechanism_of_action: ext.text("mechanism_of_action", LABEL_MECHANISM),
            indications: ext.text("indications", LABEL_INDICATIONS),
            contraindications: ext.text("contraindications", LABEL_CONTRAINDICATIONS),
            warnings: ext.text("warnings", LABEL_WARNINGS),
            dosage_and_administration: ext.text("dosage_and_administration", LABEL_DOSAGE),
            formulations,
            interactions,
            has_label_text: false,
            has_therapeutic_equivalent: false,
            confidence_score: 0.0,
            data_sources: vec![Source::DrugLabels.as_str().to_string()],
        };

        drug.has_label_text = drug.indications.is_some()
            || drug.warnings.is_some()
            || drug.dosage_and_administration.is_some();
        drug.confidence_score = completeness(&[
            !drug.brand_names.is_empty(),
            !drug.manufacturers.is_empty(),
            drug.therapeutic_class.is_some(),
            drug.mechanism_of_action.is_some(),
            drug.indications.is_some(),
            drug.warnings.is_some(),
        ]);

        draft(Source::DrugLabels, drug, index, ext)
    }
}

// ============================================================================
// NDC product directory
// ============================================================================

const NDC_GENERIC: &[FieldPath] = &[
    Pointer("/NONPROPRIETARYNAME"),
    Pointer("/nonproprietary_name"),
    Pointer("/generic_name"),
];
const NDC_BRAND: &[FieldPath] = &[
    Pointer("/PROPRIETARYNAME"),
    Pointer("/proprietary_name"),
    Pointer("/brand_name"),
];
const NDC_CODE: &[FieldPath] = &[
    Pointer("/PRODUCTNDC"),
    Pointer("/product_ndc"),
    Pointer("/ndc"),
];
const NDC_LABELER: &[FieldPath] = &[Pointer("/LABELERNAME"), Pointer("/labeler_name")];
const NDC_SUBSTANCES: &[FieldPath] = &[
    Split("/SUBSTANCENAME", ";"),
    Split("/substance_name", ";"),
];
const NDC_ROUTES: &[FieldPath] = &[Split("/ROUTENAME", ";"), Split("/route", ";")];
const NDC_DOSAGE_FORM: &[FieldPath] = &[Pointer("/DOSAGEFORMNAME"), Pointer("/dosage_form")];
const NDC_STRENGTH: &[FieldPath] = &[
    Pointer("/ACTIVE_NUMERATOR_STRENGTH"),
    Pointer("/active_numerator_strength"),
];
const NDC_STRENGTH_UNIT: &[FieldPath] = &[
    Pointer("/ACTIVE_INGRED_UNIT"),
    Pointer("/active_ingred_unit"),
];
const NDC_APPLICATION: &[FieldPath] = &[
    Pointer("/APPLICATIONNUMBER"),
    Pointer("/application_number"),
];
const NDC_CATEGORY: &[FieldPath] = &[
    Pointer("/MARKETINGCATEGORYNAME"),
    Pointer("/marketing_category"),
];
const NDC_CLASSES: &[FieldPath] = &[Pointer("/PHARM_CLASSES"), Pointer("/pharm_class")];

pub struct NdcParser;

impl RecordParser for NdcParser {
    fn source(&self) -> Source {
        Source::NdcDirectory
    }

    fn parse_record(&self, record: &Value, index: usize) -> RecordOutcome {
        if !record.is_object() {
            return RecordOutcome::Skipped(SkipReason::NotAnObject);
        }

        let mut ext = Extractor::new(record);
        let generic = ext.list("generic_name", NDC_GENERIC);
        let brand_names = ext.list("brand_names", NDC_BRAND);
        let Some(key) = identity(&generic, &brand_names) else {
            return RecordOutcome::Skipped(SkipReason::MissingIdentity);
        };

        let routes = ext.list("routes", NDC_ROUTES);
        let strength = match (
            ext.text("strength", NDC_STRENGTH),
            ext.text("strength_unit", NDC_STRENGTH_UNIT),
        ) {
            (Some(amount), Some(unit)) => Some(format!("{} {}", amount, unit)),
            (amount, _) => amount,
        };

        let formulation = Formulation {
            ndc: ext.text("ndc", NDC_CODE),
            brand_name: brand_names.first().cloned(),
            dosage_form: ext.text("dosage_form", NDC_DOSAGE_FORM),
            route: (!routes.is_empty()).then(|| routes.join("; ")),
            strength,
            application_number: ext.text("application_number", NDC_APPLICATION),
            te_code: None,
            marketing_category: ext.text("marketing_category", NDC_CATEGORY),
        };

        // PHARM_CLASSES mixes EPC, MoA and chemical classes; the EPC entry
        // is the therapeutic class.
        let classes = ext.list("therapeutic_class", &[Split("/PHARM_CLASSES", ","), Split("/pharm_class", ",")]);
        let therapeutic_class = classes
            .iter()
            .find(|c| c.ends_with("[EPC]"))
            .or_else(|| classes.first())
            .cloned()
            .or_else(|| ext.text("therapeutic_class", NDC_CLASSES));

        let mut drug = DrugRecord {
            generic_name: key,
            brand_names,
            manufacturers: ext.list("manufacturers", NDC_LABELER),
            active_ingredients: ext.list("active_ingredients", NDC_SUBSTANCES),
            routes,
            therapeutic_class,
            formulations: if formulation.is_empty() {
                Vec::new()
            } else {
                vec![formulation]
            },
            confidence_score: 0.0,
            data_sources: vec![Source::NdcDirectory.as_str().to_string()],
            ..Default::default()
        };

        drug.confidence_score = completeness(&[
            !drug.brand_names.is_empty(),
            !drug.manufacturers.is_empty(),
            !drug.active_ingredients.is_empty(),
            drug.therapeutic_class.is_some(),
        ]);

        draft(Source::NdcDirectory, drug, index, ext)
    }
}

// ============================================================================
// Orange Book
// ============================================================================

const OB_INGREDIENT: &[FieldPath] = &[Pointer("/Ingredient"), Pointer("/ingredient")];
const OB_INGREDIENTS: &[FieldPath] = &[Split("/Ingredient", ";"), Split("/ingredient", ";")];
const OB_TRADE_NAME: &[FieldPath] = &[Pointer("/Trade_Name"), Pointer("/trade_name")];
const OB_APPLICANT: &[FieldPath] = &[
    Pointer("/Applicant_Full_Name"),
    Pointer("/applicant_full_name"),
    Pointer("/Applicant"),
];
const OB_FORM_ROUTE: &[FieldPath] = &[Pointer("/DF;Route"), Pointer("/df_route")];
const OB_STRENGTH: &[FieldPath] = &[Pointer("/Strength"), Pointer("/strength")];
const OB_APPL_TYPE: &[FieldPath] = &[Pointer("/Appl_Type"), Pointer("/appl_type")];
const OB_APPL_NO: &[FieldPath] = &[Pointer("/Appl_No"), Pointer("/appl_no")];
const OB_TE_CODE: &[FieldPath] = &[Pointer("/TE_Code"), Pointer("/te_code")];

pub struct OrangeBookParser;

impl RecordParser for OrangeBookParser {
    fn source(&self) -> Source {
        Source::OrangeBook
    }

    fn parse_record(&self, record: &Value, index: usize) -> RecordOutcome {
        if !record.is_object() {
            return RecordOutcome::Skipped(SkipReason::NotAnObject);
        }

        let mut ext = Extractor::new(record);
        let generic = ext.list("generic_name", OB_INGREDIENT);
        let brand_names = ext.list("brand_names", OB_TRADE_NAME);
        let Some(key) = identity(&generic, &brand_names) else {
            return RecordOutcome::Skipped(SkipReason::MissingIdentity);
        };

        // "AEROSOL, METERED;INHALATION"
        let (dosage_form, route) = match ext.text("dosage_form_route", OB_FORM_ROUTE) {
            Some(raw) => match raw.split_once(';') {
                Some((form, route)) => (
                    Some(form.trim().to_string()).filter(|s| !s.is_empty()),
                    Some(route.trim().to_string()).filter(|s| !s.is_empty()),
                ),
                None => (Some(raw), None),
            },
            None => (None, None),
        };

        let application_number = match (ext.text("appl_type", OB_APPL_TYPE), ext.text("appl_no", OB_APPL_NO)) {
            (Some(kind), Some(number)) => Some(format!("{}{}", kind, number)),
            (None, Some(number)) => Some(number),
            _ => None,
        };
        let te_code = ext.text("te_code", OB_TE_CODE);

        let formulation = Formulation {
            ndc: None,
            brand_name: brand_names.first().cloned(),
            dosage_form,
            route: route.clone(),
            strength: ext.text("strength", OB_STRENGTH),
            application_number,
            te_code: te_code.clone(),
            marketing_category: None,
        };

        let mut drug = DrugRecord {
            generic_name: key,
            brand_names,
            manufacturers: ext.list("manufacturers", OB_APPLICANT),
            active_ingredients: ext.list("active_ingredients", OB_INGREDIENTS),
            routes: route.into_iter().collect(),
            formulations: if formulation.is_empty() {
                Vec::new()
            } else {
                vec![formulation]
            },
            has_therapeutic_equivalent: te_code.is_some(),
            confidence_score: 0.0,
            data_sources: vec![Source::OrangeBook.as_str().to_string()],
            ..Default::default()
        };

        drug.confidence_score = completeness(&[
            !drug.brand_names.is_empty(),
            !drug.manufacturers.is_empty(),
            drug.has_therapeutic_equivalent,
        ]);

        draft(Source::OrangeBook, drug, index, ext)
    }
}
