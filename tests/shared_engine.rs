//! プロセス全体で共有する推論エンジンのライフサイクル
//!
//! グローバル状態を扱うため、このファイルのテストは1つだけにしています。

mod common;

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

use cat_classifier_lib::ml::inference::shared;
use cat_classifier_lib::ml::train_model;
use cat_classifier_lib::ClassifierError;

use common::{small_config, write_dataset};

#[test]
fn test_shared_engine_loads_once_and_retries_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 4);
    let mut config = small_config(dir.path());
    config.training.num_epochs = 1;
    let artifact = config.model.checkpoint_path.clone();
    let class_map = config.model.class_map_path.clone();
    let image = dir.path().join("dataset/cats/img_00.png");

    // チェックポイントがまだない
    let err = shared::predict_path(&artifact, &class_map, &image).unwrap_err();
    assert!(matches!(err, ClassifierError::ModelNotLoaded(_)));
    assert!(!shared::is_loaded());

    train_model::<Autodiff<NdArray<f32>>>(&config, &NdArrayDevice::Cpu).unwrap();

    let first = shared::predict_path(&artifact, &class_map, &image).unwrap();
    assert!(shared::is_loaded());

    // 不正な入力はその呼び出しだけが失敗する
    let err = shared::predict_bytes(&artifact, &class_map, b"").unwrap_err();
    assert!(matches!(err, ClassifierError::InvalidImage(_)));

    // ディスク上のファイルを消しても、読み込み済みのモデルが使われる
    std::fs::remove_file(&artifact).unwrap();
    let again = shared::predict_bytes(&artifact, &class_map, &std::fs::read(&image).unwrap()).unwrap();
    assert_eq!(first, again);

    // 並行する呼び出しからも同じ結果
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let artifact = artifact.clone();
            let class_map = class_map.clone();
            let image = image.clone();
            std::thread::spawn(move || shared::predict_path(&artifact, &class_map, &image).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), first);
    }
}
